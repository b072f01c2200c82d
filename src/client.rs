// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! The dialing client. The coordinator drives it through an ordered event
//! sequence per round: `newround` snapshots a verified config, `mix`
//! uploads exactly one onion (a queued call or cover traffic), `mailbox`
//! probes the round's Bloom filter for incoming dial tokens and then burns
//! the round's wheel keys. One mutex guards the round map, config
//! snapshot, call queue, and wheel; it is never held across network I/O or
//! application callbacks.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use x25519_dalek::PublicKey;

use crate::bloom::Filter;
use crate::config::{fetch_and_verify_chain, ConfigSource, DialingConfig, SignedConfig};
use crate::coordinator::{
    ConnSender, Event, MailboxUrl, MixRound, NewRound, OnionMsg, RoundError, ServiceData,
};
use crate::persist::{
    Friend, IncomingFriendRequest, OutgoingFriendRequest, PersistedState, SentFriendRequest,
    write_file_atomic,
};
use crate::pkg::client::Registration;
use crate::wheel::{KeyWheel, TOKEN_SIZE};
use crate::{mailbox_of, onion, username_to_identity, ConnectionSettings, INTENT_MAX};

/// Application callbacks. The client mutex is released before any of
/// these run, so handlers may call back into the client.
pub trait EventHandler: Send + Sync {
    fn error(&self, err: anyhow::Error);
    fn new_config(&self, chain: &[SignedConfig]);
    fn sending_call(&self, call: &OutgoingCall);
    fn received_call(&self, call: &IncomingCall);
}

/// Fetches one mailbox's serialized Bloom filter from a CDN.
pub trait MailboxFetcher: Send + Sync {
    fn fetch(&self, cdn_server: &str, base_url: &str, mailbox_id: u32) -> Result<Vec<u8>>;
}

/// Default CDN access over HTTPS.
pub struct HttpMailboxFetcher;

impl MailboxFetcher for HttpMailboxFetcher {
    fn fetch(&self, cdn_server: &str, base_url: &str, mailbox_id: u32) -> Result<Vec<u8>> {
        let base = if base_url.starts_with("http") {
            base_url.to_string()
        } else {
            format!("https://{cdn_server}{base_url}")
        };
        let url = format!("{base}/{mailbox_id}");
        let resp = reqwest::blocking::get(&url)
            .and_then(reqwest::blocking::Response::error_for_status)
            .with_context(|| format!("fetching mailbox {url}"))?;
        Ok(resp.bytes()?.to_vec())
    }
}

/// A call queued by the application, sent in some future round.
#[derive(Clone, Debug)]
pub struct OutgoingCall {
    pub username: String,
    pub intent: u32,
    pub sent_round: Option<u32>,
}

/// A call detected in a round's Bloom filter.
#[derive(Clone, Debug)]
pub struct IncomingCall {
    pub username: String,
    pub intent: u32,
    pub session_key: [u8; 32],
}

/// What goes through the mixnet for one user in one round.
struct MixMessage {
    mailbox: u32,
    token: [u8; TOKEN_SIZE],
}

const MIX_MESSAGE_SIZE: usize = 4 + TOKEN_SIZE;

impl MixMessage {
    fn cover() -> Self {
        Self {
            mailbox: 0,
            token: [0u8; TOKEN_SIZE],
        }
    }

    fn marshal(&self) -> [u8; MIX_MESSAGE_SIZE] {
        let mut out = [0u8; MIX_MESSAGE_SIZE];
        out[..4].copy_from_slice(&self.mailbox.to_be_bytes());
        out[4..].copy_from_slice(&self.token);
        out
    }
}

struct DialingRoundState {
    config: DialingConfig,
    config_parent: SignedConfig,
}

struct ClientState {
    dialing_rounds: HashMap<u32, DialingRoundState>,
    dialing_config: SignedConfig,
    dialing_config_hash: [u8; 32],
    outgoing_calls: VecDeque<OutgoingCall>,
    wheel: KeyWheel,
    friends: HashMap<String, Friend>,
    incoming_friend_requests: Vec<IncomingFriendRequest>,
    outgoing_friend_requests: Vec<OutgoingFriendRequest>,
    sent_friend_requests: Vec<SentFriendRequest>,
    registrations: HashMap<String, Registration>,
}

/// A dialing client for one username.
pub struct Client {
    username: String,
    long_term_public: VerifyingKey,
    long_term_private: SigningKey,
    connection_settings: ConnectionSettings,
    client_persist_path: Option<PathBuf>,
    keywheel_persist_path: Option<PathBuf>,
    handler: Box<dyn EventHandler>,
    config_source: Box<dyn ConfigSource>,
    mailboxes: Box<dyn MailboxFetcher>,
    last_dialing_round: AtomicU32,
    state: Mutex<ClientState>,
}

impl Client {
    /// Creates a client trusting `dialing_config` as its config chain tip.
    pub fn new(
        username: &str,
        long_term_private: SigningKey,
        connection_settings: ConnectionSettings,
        dialing_config: SignedConfig,
        handler: Box<dyn EventHandler>,
        config_source: Box<dyn ConfigSource>,
    ) -> Result<Self> {
        username_to_identity(username)?;
        let long_term_public = long_term_private.verifying_key();
        let dialing_config_hash = dialing_config.hash();
        Ok(Self {
            username: username.to_string(),
            long_term_public,
            long_term_private,
            connection_settings,
            client_persist_path: None,
            keywheel_persist_path: None,
            handler,
            config_source,
            mailboxes: Box::new(HttpMailboxFetcher),
            last_dialing_round: AtomicU32::new(0),
            state: Mutex::new(ClientState {
                dialing_rounds: HashMap::new(),
                dialing_config,
                dialing_config_hash,
                outgoing_calls: VecDeque::new(),
                wheel: KeyWheel::new(),
                friends: HashMap::new(),
                incoming_friend_requests: Vec::new(),
                outgoing_friend_requests: Vec::new(),
                sent_friend_requests: Vec::new(),
                registrations: HashMap::new(),
            }),
        })
    }

    /// Loads a client from its persisted files. The key wheel file is
    /// optional on first run.
    pub fn load(
        client_path: &Path,
        keywheel_path: &Path,
        dialing_config: SignedConfig,
        handler: Box<dyn EventHandler>,
        config_source: Box<dyn ConfigSource>,
    ) -> Result<Self> {
        let persisted = PersistedState::load(client_path)
            .with_context(|| format!("loading client state from {}", client_path.display()))?;
        let wheel = match std::fs::read(keywheel_path) {
            Ok(data) => KeyWheel::unmarshal_binary(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => KeyWheel::new(),
            Err(e) => {
                return Err(anyhow!(e))
                    .with_context(|| format!("loading keywheel from {}", keywheel_path.display()))
            }
        };

        let mut client = Self::new(
            &persisted.username,
            SigningKey::from_bytes(&persisted.long_term_private_key),
            persisted.connection_settings.clone(),
            dialing_config,
            handler,
            config_source,
        )?;
        client.client_persist_path = Some(client_path.to_path_buf());
        client.keywheel_persist_path = Some(keywheel_path.to_path_buf());
        {
            let st = client.state.get_mut().unwrap();
            st.wheel = wheel;
            st.friends = persisted.friends;
            st.incoming_friend_requests = persisted.incoming_friend_requests;
            st.outgoing_friend_requests = persisted.outgoing_friend_requests;
            st.sent_friend_requests = persisted.sent_friend_requests;
            st.registrations = persisted.registrations;
        }
        Ok(client)
    }

    /// Sets where the client persists itself. Without paths the client is
    /// memory-only.
    pub fn set_persist_paths(&mut self, client_path: PathBuf, keywheel_path: PathBuf) {
        self.client_persist_path = Some(client_path);
        self.keywheel_persist_path = Some(keywheel_path);
    }

    /// Replaces the CDN access used for mailbox downloads.
    pub fn set_mailbox_fetcher(&mut self, fetcher: Box<dyn MailboxFetcher>) {
        self.mailboxes = fetcher;
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn long_term_key(&self) -> VerifyingKey {
        self.long_term_public
    }

    /// The most recent round a mix message was submitted for. Lock-free.
    #[must_use]
    pub fn last_dialing_round(&self) -> u32 {
        self.last_dialing_round.load(Ordering::SeqCst)
    }

    /// Queues a call. It is sent in the next round that opens, one call
    /// per round.
    pub fn call(&self, username: &str, intent: u32) -> Result<()> {
        if intent >= INTENT_MAX {
            return Err(anyhow!("intent {intent} out of range, max {}", INTENT_MAX - 1));
        }
        let mut st = self.state.lock().unwrap();
        if !st.wheel.contains(username) {
            return Err(anyhow!("no shared keys with {username}"));
        }
        st.outgoing_calls.push_back(OutgoingCall {
            username: username.to_string(),
            intent,
            sent_round: None,
        });
        Ok(())
    }

    /// Records a completed friendship: the friend's long-term key and the
    /// shared wheel secret anchored at `round`.
    pub fn add_friend(
        &self,
        username: &str,
        long_term_key: [u8; 32],
        round: u32,
        secret: [u8; 32],
    ) -> Result<()> {
        username_to_identity(username)?;
        let mut st = self.state.lock().unwrap();
        st.friends.insert(
            username.to_string(),
            Friend {
                username: username.to_string(),
                long_term_key,
                extra_data: Vec::new(),
            },
        );
        st.wheel.put(username, round, secret);
        self.persist_locked(&st)
    }

    /// Registers this client's username with a PKG and remembers the
    /// registration.
    pub fn register(&self, server_address: &str, server_key: [u8; 32]) -> Result<()> {
        let registration = Registration::new(server_address, server_key, &self.username);
        registration.register().context("registering with pkg")?;
        let mut st = self.state.lock().unwrap();
        st.registrations
            .insert(server_address.to_string(), registration);
        self.persist_locked(&st)
    }

    /// Writes the client and key-wheel files. Only needed explicitly when
    /// creating a new client; the client persists itself on state changes.
    pub fn persist(&self) -> Result<()> {
        let st = self.state.lock().unwrap();
        self.persist_locked(&st)
    }

    fn persist_locked(&self, st: &ClientState) -> Result<()> {
        let mut result = Ok(());
        if let Some(path) = &self.client_persist_path {
            let persisted = PersistedState {
                username: self.username.clone(),
                long_term_public_key: self.long_term_public.to_bytes(),
                long_term_private_key: self.long_term_private.to_bytes(),
                connection_settings: self.connection_settings.clone(),
                incoming_friend_requests: st.incoming_friend_requests.clone(),
                outgoing_friend_requests: st.outgoing_friend_requests.clone(),
                sent_friend_requests: st.sent_friend_requests.clone(),
                friends: st.friends.clone(),
                registrations: st.registrations.clone(),
            };
            result = persisted
                .store(path)
                .with_context(|| format!("writing client state to {}", path.display()));
        }
        if self.keywheel_persist_path.is_some() {
            let wheel_result = self.persist_keywheel_locked(st);
            if result.is_ok() {
                result = wheel_result;
            }
        }
        result
    }

    fn persist_keywheel_locked(&self, st: &ClientState) -> Result<()> {
        let Some(path) = &self.keywheel_persist_path else {
            return Ok(());
        };
        write_file_atomic(path, &st.wheel.marshal_binary())
            .with_context(|| format!("writing keywheel to {}", path.display()))
    }

    /// Dispatches one coordinator event.
    pub fn handle_event(&self, conn: &dyn ConnSender, event: &Event) {
        match event {
            Event::NewRound(nr) => self.new_dialing_round(nr),
            Event::Mix(mr) => self.send_dialing_onion(conn, mr),
            Event::Mailbox(mb) => self.scan_bloom_filter(mb),
            Event::Error(re) => self.dialing_round_error(re),
        }
    }

    fn new_dialing_round(&self, v: &NewRound) {
        let current = {
            let mut st = self.state.lock().unwrap();
            if let Some(round_st) = st.dialing_rounds.get(&v.round) {
                let recorded = round_st.config_parent.hash();
                drop(st);
                if recorded != v.config_hash {
                    self.handler.error(anyhow!(
                        "coordinator announced different configs for round {}",
                        v.round
                    ));
                }
                return;
            }
            // common case: the announced config is the one we already hold
            if v.config_hash == st.dialing_config_hash {
                let round_state = DialingRoundState {
                    config: st.dialing_config.inner.clone(),
                    config_parent: st.dialing_config.clone(),
                };
                st.dialing_rounds.insert(v.round, round_state);
                return;
            }
            st.dialing_config.clone()
        };

        let chain =
            match fetch_and_verify_chain(self.config_source.as_ref(), &current, v.config_hash) {
                Ok(chain) => chain,
                Err(e) => {
                    self.handler.error(e.context("fetching dialing config"));
                    return;
                }
            };
        self.handler.new_config(&chain);

        let new_config = chain.into_iter().next().expect("verified chain is nonempty");
        let mut st = self.state.lock().unwrap();
        st.dialing_config = new_config.clone();
        st.dialing_config_hash = v.config_hash;
        if let Err(e) = self.persist_locked(&st) {
            panic!("failed to persist state: {e}");
        }
        st.dialing_rounds.insert(
            v.round,
            DialingRoundState {
                config: new_config.inner.clone(),
                config_parent: new_config,
            },
        );
    }

    fn send_dialing_onion(&self, conn: &dyn ConnSender, v: &MixRound) {
        let round = v.mix_settings.round;
        let mix_servers = {
            let st = self.state.lock().unwrap();
            match st.dialing_rounds.get(&round) {
                Some(round_st) => round_st.config.mix_servers.clone(),
                None => {
                    drop(st);
                    self.handler
                        .error(anyhow!("mix settings for unconfigured round {round}"));
                    return;
                }
            }
        };

        let service_data = match ServiceData::unmarshal(&v.mix_settings.raw_service_data) {
            Ok(sd) => sd,
            Err(e) => {
                self.handler
                    .error(e.context(format!("round {round}: parsing service data")));
                return;
            }
        };

        let settings_msg = v.mix_settings.signing_message();
        if v.mix_signatures.len() != mix_servers.len() {
            self.handler.error(anyhow!(
                "round {round}: {} mixer signatures for {} mixers",
                v.mix_signatures.len(),
                mix_servers.len()
            ));
            return;
        }
        for (mixer, sig) in mix_servers.iter().zip(&v.mix_signatures) {
            let verified = VerifyingKey::from_bytes(&mixer.key)
                .map(|key| key.verify(&settings_msg, &Signature::from_bytes(sig)).is_ok())
                .unwrap_or(false);
            if !verified {
                self.handler.error(anyhow!(
                    "round {round}: failed to verify mixnet settings for key {}",
                    hex::encode(mixer.key)
                ));
                return;
            }
        }

        self.last_dialing_round.store(round, Ordering::SeqCst);

        let mut mix_message = MixMessage::cover();
        if let Some(call) = self.next_outgoing_call(round) {
            let token = {
                let st = self.state.lock().unwrap();
                st.wheel
                    .outgoing_dial_token(&self.username, &call.username, round, call.intent)
            };
            match token {
                Some(token) => {
                    self.handler.sending_call(&call);
                    mix_message.token = token;
                    mix_message.mailbox =
                        mailbox_of(&call.username, service_data.num_mailboxes);
                }
                // keys were erased since the call was queued; this round
                // degrades to cover traffic
                None => self.handler.error(anyhow!(
                    "round {round}: no keywheel secret for {}",
                    call.username
                )),
            }
        }

        let onion_keys: Vec<PublicKey> = v
            .mix_settings
            .onion_keys
            .iter()
            .map(|key| PublicKey::from(*key))
            .collect();
        let onion = onion::seal(
            &mix_message.marshal(),
            &onion::forward_nonce(round),
            &onion_keys,
        );

        let reply = OnionMsg { round, onion };
        let body = serde_json::to_value(&reply).expect("onion message is always serializable");
        if let Err(e) = conn.send("onion", body) {
            self.handler
                .error(e.context(format!("round {round}: sending onion")));
        }
    }

    fn next_outgoing_call(&self, round: u32) -> Option<OutgoingCall> {
        let mut st = self.state.lock().unwrap();
        let mut call = st.outgoing_calls.pop_front()?;
        call.sent_round = Some(round);
        Some(call)
    }

    fn scan_bloom_filter(&self, v: &MailboxUrl) {
        let cdn_server = {
            let st = self.state.lock().unwrap();
            match st.dialing_rounds.get(&v.round) {
                Some(round_st) => round_st.config.cdn_server.clone(),
                None => return,
            }
        };

        let mailbox_id = mailbox_of(&self.username, v.num_mailboxes);
        let data = match self.mailboxes.fetch(&cdn_server, &v.url, mailbox_id) {
            Ok(data) => data,
            Err(e) => {
                self.handler.error(e.context("fetching mailbox"));
                return;
            }
        };
        let filter = match Filter::unmarshal_binary(&data) {
            Ok(filter) => filter,
            Err(e) => {
                self.handler
                    .error(anyhow!(e).context("decoding bloom filter"));
                return;
            }
        };

        let mut calls = Vec::new();
        {
            let st = self.state.lock().unwrap();
            for user in st.wheel.incoming_dial_tokens(&self.username, v.round, INTENT_MAX) {
                for (intent, token) in user.tokens.iter().enumerate() {
                    if !filter.test(token) {
                        continue;
                    }
                    if let Some(session_key) = st.wheel.session_key(&user.from_username, v.round)
                    {
                        calls.push(IncomingCall {
                            username: user.from_username.clone(),
                            intent: intent as u32,
                            session_key,
                        });
                    }
                }
            }
        }
        for call in &calls {
            self.handler.received_call(call);
        }

        let mut st = self.state.lock().unwrap();
        st.wheel.erase_keys(v.round);
        if let Err(e) = self.persist_keywheel_locked(&st) {
            // continuing with live keys on disk would break forward secrecy
            panic!("failed to persist keywheel: {e}");
        }
    }

    fn dialing_round_error(&self, v: &RoundError) {
        self.handler.error(anyhow!(
            "error from dialing coordinator for round {}: {}",
            v.round,
            v.err
        ));
    }

    #[cfg(test)]
    pub(crate) fn recorded_config_hash(&self, round: u32) -> Option<[u8; 32]> {
        let st = self.state.lock().unwrap();
        st.dialing_rounds
            .get(&round)
            .map(|round_st| round_st.config_parent.hash())
    }

    #[cfg(test)]
    pub(crate) fn incoming_token_count(&self, round: u32) -> usize {
        let st = self.state.lock().unwrap();
        st.wheel
            .incoming_dial_tokens(&self.username, round, INTENT_MAX)
            .len()
    }
}
