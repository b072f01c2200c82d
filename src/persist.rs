// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! On-disk client state. The client file and the key-wheel file are
//! written atomically (temp file, fsync, rename) at mode 0600, and always
//! together, so neither can get ahead of the other and leak metadata
//! through skew.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pkg::client::Registration;
use crate::ConnectionSettings;

/// A confirmed friend, as stored on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Friend {
    pub username: String,
    #[serde(with = "crate::hexarray")]
    pub long_term_key: [u8; 32],
    #[serde(with = "crate::hexbytes", default)]
    pub extra_data: Vec<u8>,
}

/// A friend request we received and have not yet answered. Plain data;
/// the loading client reattaches its own handle at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncomingFriendRequest {
    pub username: String,
    #[serde(with = "crate::hexarray")]
    pub long_term_key: [u8; 32],
    #[serde(with = "crate::hexarray")]
    pub dh_public_key: [u8; 32],
    pub dialing_round: u32,
}

/// A friend request queued to send.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutgoingFriendRequest {
    pub username: String,
    /// Expected long-term key, when the user verified one out of band.
    #[serde(with = "crate::hexarray", default)]
    pub expected_key: [u8; 32],
    pub confirmation: bool,
    pub dialing_round: u32,
}

/// A friend request already sent, awaiting the reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SentFriendRequest {
    pub username: String,
    pub dialing_round: u32,
    #[serde(with = "crate::hexarray")]
    pub dh_private_key: [u8; 32],
}

/// Everything in the client file.
#[derive(Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub username: String,
    #[serde(with = "crate::hexarray")]
    pub long_term_public_key: [u8; 32],
    #[serde(with = "crate::hexarray")]
    pub long_term_private_key: [u8; 32],
    pub connection_settings: ConnectionSettings,
    pub incoming_friend_requests: Vec<IncomingFriendRequest>,
    pub outgoing_friend_requests: Vec<OutgoingFriendRequest>,
    pub sent_friend_requests: Vec<SentFriendRequest>,
    pub friends: HashMap<String, Friend>,
    /// Per-PKG registrations, keyed by server address.
    pub registrations: HashMap<String, Registration>,
}

/// Writes `data` to `path` atomically with owner-only permissions.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

impl PersistedState {
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn store(&self, path: &Path) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_file_atomic(path, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> PersistedState {
        PersistedState {
            username: "alice".into(),
            long_term_public_key: [1u8; 32],
            long_term_private_key: [2u8; 32],
            connection_settings: ConnectionSettings {
                entry_addr: "entry.example.org:9000".into(),
                config_server: "config.example.org".into(),
            },
            incoming_friend_requests: vec![IncomingFriendRequest {
                username: "bob".into(),
                long_term_key: [3u8; 32],
                dh_public_key: [4u8; 32],
                dialing_round: 12,
            }],
            outgoing_friend_requests: Vec::new(),
            sent_friend_requests: Vec::new(),
            friends: HashMap::from([(
                "bob".to_string(),
                Friend {
                    username: "bob".into(),
                    long_term_key: [3u8; 32],
                    extra_data: Vec::new(),
                },
            )]),
            registrations: HashMap::new(),
        }
    }

    #[test]
    fn store_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("client-state");
        let state = sample_state();
        state.store(&path).unwrap();
        let back = PersistedState::load(&path).unwrap();
        assert_eq!(back.username, "alice");
        assert_eq!(back.friends["bob"].long_term_key, [3u8; 32]);
        assert_eq!(back.incoming_friend_requests[0].dialing_round, 12);
    }

    #[cfg(unix)]
    #[test]
    fn state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("client-state");
        sample_state().store(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn atomic_write_replaces_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        write_file_atomic(&path, b"one").unwrap();
        write_file_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!path.with_extension("tmp").exists());
    }
}
