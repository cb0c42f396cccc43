//! Schema fingerprint
//!
//! Both peers hash the same textual description of the wire schema and compare
//! the digests during the handshake. The description covers the framing rules
//! as well as every message shape, so a change to either shows up as a
//! mismatch. Any edit to the envelope types must be mirrored in
//! [`SCHEMA_DESCRIPTOR`].

use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Canonical description of the wire schema
pub const SCHEMA_DESCRIPTOR: &str = "\
framing: length=u32 order=big-endian counts=payload-only
encoding: json
envelope: correlation_id:string oneof(control|request|response|event)
control.hello: token:string protocol_version:string features:[string] schema_fingerprint:string client_name:string client_version:string metadata:map<string,string>
control.welcome: protocol_version:string features:[string] schema_fingerprint:string host_name:string host_version:string platform:string runtime_version:string session_id:string metadata:map<string,string>
control.reject: code:enum(unauthenticated|failed_precondition|permission_denied|out_of_range|internal|unavailable) message:string
request: oneof(health|assets|build)
request.assets: oneof(refresh|import{path}|move{from,to}|delete{path})
request.build: oneof(player{target,output_path,development}|bundles{target,output_path})
response: oneof(health|assets|build|error)
response.health: ready:bool host_version:string busy_reason:string? uptime_ms:u64
response.assets: affected:[string]
response.build: operation_id:string target:string output_path:string success:bool duration_ms:u64 size_bytes:u64 warnings:[string]
response.error: code:enum(feature_not_negotiated|invalid_argument|not_found|unavailable|internal) message:string
event: timestamp_ms:u64 kind:oneof(log|operation)
event.log: level:enum(trace|debug|info|warn|error) message:string target:string
event.operation: operation_id:string name:string stage:oneof(started|progress{fraction:f32,detail}|completed|failed{message})
";

/// Hex-encoded SHA-256 of an arbitrary descriptor
pub fn fingerprint_of(descriptor: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(descriptor.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint of the schema compiled into this build
pub fn schema_fingerprint() -> &'static str {
    static FINGERPRINT: OnceLock<String> = OnceLock::new();
    FINGERPRINT.get_or_init(|| fingerprint_of(SCHEMA_DESCRIPTOR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let fp = schema_fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(fp, schema_fingerprint());
    }

    #[test]
    fn test_fingerprint_is_lowercase_sha256() {
        assert_eq!(
            fingerprint_of("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_framing_drift_changes_fingerprint() {
        let drifted = SCHEMA_DESCRIPTOR.replace("order=big-endian", "order=little-endian");
        assert_ne!(fingerprint_of(&drifted), schema_fingerprint());
    }
}
