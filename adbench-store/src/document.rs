//! The synthetic advertisement history record and its generator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mongodb::bson::DateTime;
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

/// Default size of the device pool that records are spread over.
pub const DEFAULT_DEVICE_POOL: u64 = 1_000_000;

const EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);
const SERVER_RECEIVE_OFFSET: Duration = Duration::from_secs(60 * 60);
const DEVICE_RECEIVE_OFFSET: Duration = Duration::from_secs(2 * 60 * 60);

/// One advertisement history entry as written to the store.
///
/// Field names on the wire follow the `AdvertisementHistory` collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdRecord {
    /// Primary key, assigned by the server on insert.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    /// Sequence number issued by the [`DocumentGenerator`].
    #[serde(rename = "seq")]
    pub sequence: i64,
    #[serde(rename = "reqRefNo")]
    pub request_ref_no: String,
    pub rrn: String,
    #[serde(rename = "transactionType")]
    pub transaction_type: i32,
    #[serde(rename = "transactionMode")]
    pub transaction_mode: i32,
    #[serde(rename = "txnAmt")]
    pub amount: String,
    #[serde(rename = "txnTimeStamp")]
    pub transaction_timestamp: String,
    /// Creation time. Time-series collections use this as their time field.
    #[serde(rename = "timeStamp")]
    pub timestamp: DateTime,
    #[serde(rename = "deviceId")]
    pub device_id: i64,
    /// Unix seconds.
    #[serde(rename = "expirationTime")]
    pub expiration_time: i64,
    /// Unix seconds.
    #[serde(rename = "tMsgRecvByServer")]
    pub msg_received_by_server: i64,
    /// Unix seconds.
    #[serde(rename = "tMsgRecvFromDev")]
    pub msg_received_from_device: i64,
    #[serde(rename = "audioPlayed")]
    pub audio_played: i32,
}

/// Issues [`AdRecord`]s with strictly increasing sequence numbers.
///
/// The counter starts at zero for every generator and is advanced atomically, so a generator can
/// be shared between tasks without issuing a sequence number twice.
#[derive(Debug)]
pub struct DocumentGenerator {
    counter: AtomicU64,
    devices: u64,
}

impl DocumentGenerator {
    /// Creates a generator spreading records over `devices` distinct device ids.
    ///
    /// A pool of zero is treated as a single device.
    pub fn new(devices: u64) -> Self {
        Self {
            counter: AtomicU64::new(0),
            devices: devices.max(1),
        }
    }

    /// Returns the number of records issued so far, which is also the last sequence number.
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Issues the next record.
    pub fn next(&self) -> AdRecord {
        let seq = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.build(seq, DateTime::now())
    }

    fn build(&self, seq: u64, now: DateTime) -> AdRecord {
        let now_secs = now.timestamp_millis() / 1000;
        let offset = |d: Duration| now_secs + d.as_secs() as i64;

        AdRecord {
            id: None,
            sequence: seq as i64,
            request_ref_no: format!("REQ{seq}"),
            rrn: "ddff".to_owned(),
            transaction_type: 3,
            transaction_mode: 0,
            amount: "4000.00".to_owned(),
            transaction_timestamp: String::new(),
            timestamp: now,
            device_id: ((seq - 1) % self.devices + 1) as i64,
            expiration_time: offset(EXPIRATION),
            msg_received_by_server: offset(SERVER_RECEIVE_OFFSET),
            msg_received_from_device: offset(DEVICE_RECEIVE_OFFSET),
            audio_played: (seq % 2) as i32,
        }
    }
}

impl Default for DocumentGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_POOL)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn sequence_is_strictly_increasing() {
        let generator = DocumentGenerator::default();
        let sequences: Vec<_> = (0..100).map(|_| generator.next().sequence).collect();

        assert_eq!(sequences, (1..=100).collect::<Vec<_>>());
        assert_eq!(generator.issued(), 100);
    }

    #[test]
    fn derived_fields_follow_sequence() {
        let generator = DocumentGenerator::new(3);

        let first = generator.next();
        assert_eq!(first.request_ref_no, "REQ1");
        assert_eq!(first.audio_played, 1);
        assert_eq!(first.device_id, 1);
        assert!(first.id.is_none());

        let second = generator.next();
        assert_eq!(second.audio_played, 0);
        assert_eq!(second.device_id, 2);

        generator.next();
        // the device pool wraps around
        assert_eq!(generator.next().device_id, 1);
    }

    #[test]
    fn timestamps_are_offset_from_creation() {
        let record = DocumentGenerator::default().next();
        let created = record.timestamp.timestamp_millis() / 1000;

        assert_eq!(record.expiration_time - created, 24 * 60 * 60);
        assert_eq!(record.msg_received_by_server - created, 60 * 60);
        assert_eq!(record.msg_received_from_device - created, 2 * 60 * 60);
    }

    #[test]
    fn concurrent_callers_never_share_a_sequence() {
        let generator = Arc::new(DocumentGenerator::default());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| generator.next().sequence)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(seen.insert(seq), "sequence {seq} issued twice");
            }
        }
        assert_eq!(seen.len(), 1000);
        assert_eq!(generator.issued(), 1000);
    }
}
