//! Message envelope and channel (C2, spec §4.2).
//!
//! Wire framing, size bounds, the `!`-delimited application command
//! grammar, anti-replay signatures, and NaCl box encryption live here.
//! `registry`/`taker`/`maker` build on top of [`Envelope`] and
//! [`AppMessage`]; they never touch raw sockets directly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bdk::bitcoin::hashes::{sha256, Hash};
use bdk::bitcoin::secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey, Signing, Verification};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub const MAX_LINE_LEN: usize = 64 * 1024;
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;
pub const MAX_JSON_DEPTH: usize = 10;

/// The 10 envelope type codes (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum EnvelopeType {
    Privmsg = 685,
    Pubmsg = 687,
    Peerlist = 789,
    GetPeerlist = 791,
    Handshake = 793,
    DnHandshake = 795,
    Ping = 797,
    Pong = 799,
    Disconnect = 801,
}

impl EnvelopeType {
    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        Ok(match code {
            685 => EnvelopeType::Privmsg,
            687 => EnvelopeType::Pubmsg,
            789 => EnvelopeType::Peerlist,
            791 => EnvelopeType::GetPeerlist,
            793 => EnvelopeType::Handshake,
            795 => EnvelopeType::DnHandshake,
            797 => EnvelopeType::Ping,
            799 => EnvelopeType::Pong,
            801 => EnvelopeType::Disconnect,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// A single wire line: `{"type": <code>, "line": "<payload>"}\r\n`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub ty: u32,
    pub line: String,
}

impl Envelope {
    pub fn new(ty: EnvelopeType, line: impl Into<String>) -> Self {
        Envelope {
            ty: ty as u32,
            line: line.into(),
        }
    }

    /// Encode to a `\r\n`-terminated wire line, enforcing the size bounds
    /// from spec §4.2 before the bytes ever reach a socket.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(self)
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
        if json.len() > MAX_LINE_LEN {
            return Err(ProtocolError::OversizeMessage(format!(
                "line length {} exceeds {}",
                json.len(),
                MAX_LINE_LEN
            )));
        }
        Ok(format!("{json}\r\n"))
    }

    /// Parse and bound-check a received line (pre-JSON bounds first, per
    /// spec: "enforced before JSON parsing").
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let trimmed = raw.trim_end_matches(['\r', '\n']);
        if trimmed.len() > MAX_LINE_LEN {
            return Err(ProtocolError::OversizeMessage(format!(
                "line length {} exceeds {}",
                trimmed.len(),
                MAX_LINE_LEN
            )));
        }
        if trimmed.as_bytes().len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::OversizeMessage("message exceeds 2 MiB".into()));
        }
        check_json_depth(trimmed, MAX_JSON_DEPTH)?;

        let env: Envelope = serde_json::from_str(trimmed)
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
        // Touch the type code so malformed/unknown codes surface eagerly.
        EnvelopeType::from_code(env.ty)?;
        Ok(env)
    }
}

/// Cheap structural nesting check without building a full JSON tree;
/// sufficient to reject pathological depth before `serde_json` recurses.
fn check_json_depth(s: &str, max_depth: usize) -> Result<(), ProtocolError> {
    let mut depth: usize = 0;
    let mut max_seen: usize = 0;
    let mut in_string = false;
    let mut escape = false;
    for c in s.chars() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => {
                depth += 1;
                max_seen = max_seen.max(depth);
            }
            '}' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if max_seen > max_depth {
        return Err(ProtocolError::MalformedEnvelope(format!(
            "JSON nesting depth {max_seen} exceeds {max_depth}"
        )));
    }
    Ok(())
}

/// Parsed application payload: `{from}!{to}!{command} arg1 arg2 ...`.
/// Fields are split on single spaces only, never runs of whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    pub from_nick: String,
    pub to_nick: String,
    pub command: String,
    pub args: Vec<String>,
}

impl AppMessage {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut bang_parts = line.splitn(3, '!');
        let from_nick = bang_parts
            .next()
            .ok_or_else(|| ProtocolError::MalformedEnvelope("missing from_nick".into()))?
            .to_string();
        let to_nick = bang_parts
            .next()
            .ok_or_else(|| ProtocolError::MalformedEnvelope("missing to_nick".into()))?
            .to_string();
        let rest = bang_parts
            .next()
            .ok_or_else(|| ProtocolError::MalformedEnvelope("missing command".into()))?;

        let mut tokens = rest.split(' ');
        let command = tokens
            .next()
            .ok_or_else(|| ProtocolError::MalformedEnvelope("missing command".into()))?
            .to_string();
        let args = tokens.map(|s| s.to_string()).collect();

        Ok(AppMessage {
            from_nick,
            to_nick,
            command,
            args,
        })
    }

    pub fn render(&self) -> String {
        let args = self.args.join(" ");
        if args.is_empty() {
            format!("{}!{}!{}", self.from_nick, self.to_nick, self.command)
        } else {
            format!("{}!{}!{} {}", self.from_nick, self.to_nick, self.command, args)
        }
    }
}

/// Commands that MUST travel NaCl-boxed (spec §4.2). Encrypted messages
/// may only carry a single command.
pub fn is_encrypted_command(command: &str) -> bool {
    matches!(command, "auth" | "ioauth" | "tx" | "sig")
}

/// Hostid used in the anti-replay signed plaintext: the directory onion
/// address when routed through a directory, or the literal string for
/// direct peer channels.
pub const DIRECT_HOSTID: &str = "onion-network";

fn signed_plaintext(hostid: &str, command: &str, args: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(hostid.as_bytes());
    buf.extend_from_slice(command.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(args.as_bytes());
    buf
}

/// Sign `hostid || command || " " || args` with the ephemeral nick key,
/// producing the `<pubkey> <signature>` suffix appended to private
/// messages.
pub fn sign_message<C: Signing>(
    secp: &Secp256k1<C>,
    signing_key: &SecretKey,
    hostid: &str,
    command: &str,
    args: &str,
) -> (PublicKey, ecdsa::Signature) {
    let plaintext = signed_plaintext(hostid, command, args);
    let digest = sha256::Hash::hash(&plaintext);
    let msg = Message::from_digest_slice(digest.as_byte_array()).expect("32-byte digest");
    let sig = secp.sign_ecdsa(&msg, signing_key);
    let pubkey = PublicKey::from_secret_key(secp, signing_key);
    (pubkey, sig)
}

/// Verify the anti-replay signature. The hostid binding is what makes
/// cross-channel replay fail: a message signed for `directory-1` will not
/// verify against `directory-2`'s hostid (spec scenario 5).
pub fn verify_message<C: Verification>(
    secp: &Secp256k1<C>,
    pubkey: &PublicKey,
    signature: &ecdsa::Signature,
    hostid: &str,
    command: &str,
    args: &str,
) -> Result<(), ProtocolError> {
    let plaintext = signed_plaintext(hostid, command, args);
    let digest = sha256::Hash::hash(&plaintext);
    let msg = Message::from_digest_slice(digest.as_byte_array()).expect("32-byte digest");
    secp.verify_ecdsa(&msg, signature, pubkey)
        .map_err(|_| ProtocolError::MalformedEnvelope("anti-replay signature invalid".into()))
}

/// A logical transport a session's messages travel over: a specific
/// directory relay, or the direct peer-to-peer path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Transport {
    Direct,
    Directory(String),
}

impl Transport {
    pub fn hostid(&self) -> &str {
        match self {
            Transport::Direct => DIRECT_HOSTID,
            Transport::Directory(onion) => onion,
        }
    }
}

/// Tracks, per session, which transport its first encrypted message used.
/// Once bound, later messages on a different transport abort the session
/// (spec §4.2 "Channel consistency").
#[derive(Debug, Default)]
pub struct ChannelBinding {
    bound: HashMap<String, Transport>,
}

impl ChannelBinding {
    pub fn new() -> Self {
        ChannelBinding::default()
    }

    pub fn check_and_bind(
        &mut self,
        session_key: &str,
        transport: &Transport,
    ) -> Result<(), ProtocolError> {
        match self.bound.get(session_key) {
            Some(bound) if bound != transport => Err(ProtocolError::ChannelInconsistent {
                nick: session_key.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.bound.insert(session_key.to_string(), transport.clone());
                Ok(())
            }
        }
    }
}

/// Deduplicates broadcasts received redundantly across N attached
/// directories by `(from_nick, command, first_arg)`, for a 30-second
/// window (spec §4.2).
pub struct Deduplicator {
    seen: HashMap<(String, String, String), Instant>,
    window: Duration,
}

impl Deduplicator {
    pub fn new() -> Self {
        Deduplicator {
            seen: HashMap::new(),
            window: Duration::from_secs(30),
        }
    }

    /// Returns `true` if this is the first arrival within the window (the
    /// caller should process it); `false` for a duplicate to drop.
    pub fn observe(&mut self, from_nick: &str, command: &str, first_arg: &str, now: Instant) -> bool {
        self.prune(now);
        let key = (from_nick.to_string(), command.to_string(), first_arg.to_string());
        if self.seen.contains_key(&key) {
            false
        } else {
            self.seen.insert(key, now);
            true
        }
    }

    fn prune(&mut self, now: Instant) {
        self.seen.retain(|_, seen_at| now.duration_since(*seen_at) < self.window);
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let env = Envelope::new(EnvelopeType::Privmsg, "alice!bob!fill 1 2 3");
        let wire = env.encode().unwrap();
        assert!(wire.ends_with("\r\n"));
        let decoded = Envelope::decode(&wire).unwrap();
        assert_eq!(decoded.ty, EnvelopeType::Privmsg as u32);
        assert_eq!(decoded.line, "alice!bob!fill 1 2 3");
    }

    #[test]
    fn oversize_line_rejected() {
        let huge = "x".repeat(MAX_LINE_LEN + 1);
        let env = Envelope::new(EnvelopeType::Pubmsg, huge);
        assert!(matches!(env.encode(), Err(ProtocolError::OversizeMessage(_))));
    }

    #[test]
    fn unknown_type_code_rejected() {
        let raw = r#"{"type": 1, "line": "x"}"#;
        assert!(matches!(
            Envelope::decode(raw),
            Err(ProtocolError::UnknownType(1))
        ));
    }

    #[test]
    fn deep_json_rejected() {
        let mut nested = String::new();
        for _ in 0..12 {
            nested.push('[');
        }
        for _ in 0..12 {
            nested.push(']');
        }
        let raw = format!(r#"{{"type": 685, "line": "{nested}"}}"#);
        assert!(Envelope::decode(&raw).is_err());
    }

    #[test]
    fn app_message_parses_single_space_separated_args() {
        let msg = AppMessage::parse("J5abc!J5def!fill order1 50000 pub commit").unwrap();
        assert_eq!(msg.from_nick, "J5abc");
        assert_eq!(msg.to_nick, "J5def");
        assert_eq!(msg.command, "fill");
        assert_eq!(msg.args, vec!["order1", "50000", "pub", "commit"]);
        assert_eq!(msg.render(), "J5abc!J5def!fill order1 50000 pub commit");
    }

    #[test]
    fn anti_replay_signature_fails_across_hostids() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[5u8; 32]).unwrap();
        let (pk, sig) = sign_message(&secp, &sk, "directory-1.onion", "auth", "abc");
        assert!(verify_message(&secp, &pk, &sig, "directory-1.onion", "auth", "abc").is_ok());
        assert!(verify_message(&secp, &pk, &sig, "directory-2.onion", "auth", "abc").is_err());
    }

    #[test]
    fn channel_binding_blocks_transport_switch() {
        let mut binding = ChannelBinding::new();
        binding.check_and_bind("sess-1", &Transport::Direct).unwrap();
        assert!(binding
            .check_and_bind("sess-1", &Transport::Directory("dir.onion".into()))
            .is_err());
    }

    #[test]
    fn deduplicator_drops_second_arrival_within_window() {
        let mut dedup = Deduplicator::new();
        let now = Instant::now();
        assert!(dedup.observe("J5abc", "reloffer", "order1", now));
        assert!(!dedup.observe("J5abc", "reloffer", "order1", now));
    }

    #[test]
    fn is_encrypted_command_matches_spec_table() {
        assert!(is_encrypted_command("auth"));
        assert!(is_encrypted_command("ioauth"));
        assert!(is_encrypted_command("tx"));
        assert!(is_encrypted_command("sig"));
        assert!(!is_encrypted_command("fill"));
        assert!(!is_encrypted_command("orderbook"));
    }
}
