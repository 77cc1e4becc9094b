//! Common test utilities.
//!
//! Shared helpers for integration tests. Import with `mod common;` in test
//! files.

#![allow(dead_code)]

use stratum::api::storage::{StorageCommand, StorageCommandBody, StorageReply, StorageReplyBody};
use stratum::api::update::UpdateCommand;
use stratum::bucket::db::BucketEntry;
use stratum::bucket::replica::ReplicaInfo;
use stratum::core::config::Config;
use stratum::core::timestamp::Timestamp;
use stratum::document::fields::{Document, StoredDocument};
use stratum::document::id::{BucketSpace, DocumentId};
use stratum::ops::observability::UpdateMetrics;
use stratum::stripe::{MessageSender, StripeState};
use std::io::Write;

/// A sender that captures every sub-command for inspection.
#[derive(Debug, Default)]
pub struct CapturingSender {
    pub sent: Vec<StorageCommand>,
}

impl CapturingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the captured commands.
    pub fn take(&mut self) -> Vec<StorageCommand> {
        std::mem::take(&mut self.sent)
    }

    /// Kinds of the captured commands, in send order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.iter().map(|c| c.body.kind()).collect()
    }
}

impl MessageSender for CapturingSender {
    fn send(&mut self, command: StorageCommand) {
        self.sent.push(command);
    }
}

/// Default test configuration: one distributor owning everything.
pub fn test_config() -> Config {
    Config::default()
}

/// Configuration with the metadata phase disabled.
pub fn config_without_metadata_phase() -> Config {
    let mut config = Config::default();
    config.distributor.enable_metadata_phase = false;
    config
}

/// A stripe core with default config and fresh metrics.
pub fn test_stripe() -> StripeState {
    StripeState::new(&test_config(), UpdateMetrics::default())
}

/// A stripe core with the given config.
pub fn test_stripe_with_config(config: &Config) -> StripeState {
    StripeState::new(config, UpdateMetrics::default())
}

/// Standard test document id.
pub fn doc_id() -> DocumentId {
    DocumentId::parse("music::song-1").unwrap()
}

/// A minimal update command for the standard document.
pub fn update_command() -> UpdateCommand {
    UpdateCommand::new(doc_id(), BucketSpace::Default, "music")
}

/// Seed the stripe's bucket database with in-sync replicas on the given
/// nodes for the standard document's bucket.
pub fn seed_in_sync_replicas(stripe: &mut StripeState, nodes: &[u16]) {
    let bucket = doc_id().bucket();
    let replicas = nodes.iter().map(|&n| ReplicaInfo::new(n, 10, 0xABCD)).collect();
    stripe
        .bucket_db_mut()
        .upsert(BucketSpace::Default, bucket, BucketEntry::new(replicas));
}

/// Seed diverged replicas (different doc counts and checksums).
pub fn seed_diverged_replicas(stripe: &mut StripeState, nodes: &[u16]) {
    let bucket = doc_id().bucket();
    let replicas = nodes
        .iter()
        .enumerate()
        .map(|(i, &n)| ReplicaInfo::new(n, 10 - i as u32, 0xABCD + i as u32))
        .collect();
    stripe
        .bucket_db_mut()
        .upsert(BucketSpace::Default, bucket, BucketEntry::new(replicas));
}

/// A stored document with the given fields and persisted-timestamp.
pub fn stored_document(fields: &[(&str, serde_json::Value)], ts: u64) -> StoredDocument {
    let mut document = Document::blank(doc_id(), "music");
    for (name, value) in fields {
        document.set_field(*name, value.clone());
    }
    StoredDocument {
        document,
        persisted_timestamp: Timestamp::from_micros(ts),
    }
}

/// Successful reply to a captured direct-update command.
pub fn update_reply_ok(command: &StorageCommand, old_ts: u64) -> StorageReply {
    assert!(matches!(command.body, StorageCommandBody::Update { .. }));
    StorageReply::ok(
        command.id,
        command.node,
        StorageReplyBody::Update {
            old_timestamp: Timestamp::from_micros(old_ts),
        },
    )
}

/// Successful reply to a captured metadata get.
pub fn metadata_reply_ok(command: &StorageCommand, ts: u64, checksum: u32) -> StorageReply {
    assert!(matches!(command.body, StorageCommandBody::MetadataGet { .. }));
    StorageReply::ok(
        command.id,
        command.node,
        StorageReplyBody::MetadataGet {
            persisted_timestamp: Timestamp::from_micros(ts),
            checksum,
        },
    )
}

/// Successful reply to a captured full get.
pub fn full_get_reply_ok(
    command: &StorageCommand,
    document: Option<StoredDocument>,
) -> StorageReply {
    assert!(matches!(command.body, StorageCommandBody::FullGet { .. }));
    StorageReply::ok(command.id, command.node, StorageReplyBody::FullGet { document })
}

/// Successful reply to a captured condition probe.
pub fn probe_reply(command: &StorageCommand, matched: bool, document_found: bool) -> StorageReply {
    assert!(matches!(
        command.body,
        StorageCommandBody::ConditionProbe { .. }
    ));
    StorageReply::ok(
        command.id,
        command.node,
        StorageReplyBody::ConditionProbe {
            matched,
            document_found,
        },
    )
}

/// Successful reply to a captured put.
pub fn put_reply_ok(command: &StorageCommand) -> StorageReply {
    assert!(matches!(command.body, StorageCommandBody::Put { .. }));
    StorageReply::ok(command.id, command.node, StorageReplyBody::Put)
}

/// Decode the document payload of a captured put.
pub fn put_document(command: &StorageCommand) -> Document {
    match &command.body {
        StorageCommandBody::Put { payload, .. } => Document::from_payload(payload).unwrap(),
        other => panic!("expected put, got {}", other.kind()),
    }
}

/// The new-timestamp of a captured put.
pub fn put_timestamp(command: &StorageCommand) -> Timestamp {
    match &command.body {
        StorageCommandBody::Put { new_timestamp, .. } => *new_timestamp,
        other => panic!("expected put, got {}", other.kind()),
    }
}

/// Create a minimal valid configuration file.
pub fn create_minimal_config_file() -> tempfile::NamedTempFile {
    let config_content = r#"
[distributor]
enable_metadata_phase = true

[cluster]
distributor_count = 1
distributor_index = 0
"#;
    let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Initialize test logging once.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_file_loads() {
        let file = create_minimal_config_file();
        let config = Config::from_file(file.path()).unwrap();
        assert!(config.distributor.enable_metadata_phase);
        assert_eq!(config.cluster.distributor_count, 1);
    }

    #[test]
    fn capturing_sender_records_kinds() {
        let mut stripe = test_stripe();
        seed_in_sync_replicas(&mut stripe, &[0, 1]);
        let mut sender = CapturingSender::new();
        stripe.begin_update(update_command(), &mut sender);
        assert_eq!(sender.kinds(), vec!["update", "update"]);
    }

    #[test]
    fn stored_document_builder_sets_fields() {
        let stored = stored_document(&[("plays", serde_json::json!(7))], 100);
        assert_eq!(stored.document.fields["plays"], serde_json::json!(7));
        assert_eq!(stored.persisted_timestamp, Timestamp::from_micros(100));
    }
}
