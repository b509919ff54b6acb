//! Concurrent calendar submission with quorum, and upgrading of pending
//! attestations.

use super::attestation::Attestation;
use super::calendar::{Calendar, CalendarError, RemoteCalendar, UrlWhitelist};
use super::errors::TimestampError;
use super::timestamp::Timestamp;
use crate::config::CalendarConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(50);

#[derive(Debug, Error)]
pub enum StampError {
    #[error("no calendars configured and no quorum given")]
    NoCalendars,
    #[error("quorum {quorum} exceeds the {calendars} configured calendars")]
    QuorumTooLarge { quorum: usize, calendars: usize },
    #[error("only {succeeded} of {required} required calendars answered")]
    QuorumFailure { succeeded: usize, required: usize },
    #[error("invalid private calendar key for {url}: {reason}")]
    InvalidKey { url: String, reason: String },
    #[error("calendar setup failed: {0}")]
    Calendar(#[from] CalendarError),
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
}

pub type CalendarHandle = Arc<dyn Calendar>;

pub struct Stamper {
    calendars: Vec<CalendarHandle>,
    quorum: usize,
    workers: usize,
    call_timeout: Duration,
}

impl Stamper {
    pub fn new(calendars: Vec<CalendarHandle>, quorum: Option<usize>) -> Result<Self, StampError> {
        let quorum = match (quorum, calendars.len()) {
            (None, 0) => return Err(StampError::NoCalendars),
            (None, n) => n,
            (Some(q), n) if q > n => {
                return Err(StampError::QuorumTooLarge {
                    quorum: q,
                    calendars: n,
                })
            }
            (Some(q), _) => q,
        };

        Ok(Self {
            calendars,
            quorum,
            workers: DEFAULT_WORKERS,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    pub fn from_config(config: &CalendarConfig) -> Result<Self, StampError> {
        let mut calendars: Vec<CalendarHandle> = Vec::new();
        for url in &config.urls {
            calendars.push(Arc::new(RemoteCalendar::new(url.as_str())?));
        }
        for private in &config.private {
            let seed = decode_seed(&private.signing_key).map_err(|reason| {
                StampError::InvalidKey {
                    url: private.url.clone(),
                    reason,
                }
            })?;
            calendars.push(Arc::new(RemoteCalendar::private(
                private.url.as_str(),
                &seed,
            )?));
        }

        Ok(Self::new(calendars, config.quorum)?
            .with_workers(config.workers)
            .with_timeout(config.call_timeout()))
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn calendars(&self) -> &[CalendarHandle] {
        &self.calendars
    }

    /// Submits the timestamp's message to every calendar and merges each
    /// answer into `timestamp` until the quorum is reached.
    ///
    /// Returns the number of merged answers. Calendars still working when
    /// the quorum is met finish in the background and are ignored.
    pub async fn stamp(&self, timestamp: &mut Timestamp) -> Result<usize, StampError> {
        let msg = timestamp.msg().to_vec();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        // One slot per calendar so late senders never block.
        let (tx, mut rx) = mpsc::channel(self.calendars.len().max(1));

        for calendar in &self.calendars {
            let calendar = Arc::clone(calendar);
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let msg = msg.clone();
            let call_timeout = self.call_timeout;

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result = tokio::time::timeout(call_timeout, calendar.submit(&msg))
                    .await
                    .unwrap_or(Err(CalendarError::Timeout));
                let _ = tx.send((calendar.url().to_string(), result)).await;
            });
        }
        drop(tx);

        let mut succeeded = 0;
        while succeeded < self.quorum {
            let Some((url, result)) = rx.recv().await else {
                break;
            };
            match result {
                Ok(answer) => match timestamp.merge(&answer) {
                    Ok(()) => {
                        log::debug!("Calendar {url} answered");
                        succeeded += 1;
                    }
                    Err(e) => log::warn!("Calendar {url} answered for another message: {e}"),
                },
                Err(e) => log::warn!("Calendar {url} failed: {e}"),
            }
        }

        if succeeded < self.quorum {
            return Err(StampError::QuorumFailure {
                succeeded,
                required: self.quorum,
            });
        }
        log::info!(
            "Stamped {} with {succeeded}/{} calendars",
            hex::encode(&msg),
            self.calendars.len()
        );
        Ok(succeeded)
    }
}

fn decode_seed(hex_seed: &str) -> Result<[u8; 32], String> {
    let raw = hex::decode(hex_seed.trim()).map_err(|e| e.to_string())?;
    raw.try_into()
        .map_err(|raw: Vec<u8>| format!("expected 32 bytes, got {}", raw.len()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    /// Pending attestations whose calendar returned a block attestation.
    pub upgraded: usize,
    /// Pending attestations the calendar has not committed yet.
    pub pending: usize,
    /// Pending attestations pointing at calendars outside the whitelist.
    pub skipped: usize,
    pub failed: usize,
}

impl UpgradeReport {
    pub fn changed(&self) -> bool {
        self.upgraded > 0
    }
}

/// Builds the calendar client used to poll a pending attestation's URI.
pub trait CalendarResolver: Send + Sync {
    fn resolve(&self, uri: &str) -> Result<CalendarHandle, CalendarError>;
}

pub struct RemoteResolver;

impl CalendarResolver for RemoteResolver {
    fn resolve(&self, uri: &str) -> Result<CalendarHandle, CalendarError> {
        Ok(Arc::new(RemoteCalendar::new(uri)?))
    }
}

/// Asks the calendars behind every whitelisted pending attestation for a
/// more complete timestamp and merges the answers in place.
pub async fn upgrade_timestamp(
    timestamp: &mut Timestamp,
    whitelist: &UrlWhitelist,
    resolver: &dyn CalendarResolver,
) -> UpgradeReport {
    let mut report = UpgradeReport::default();

    let pending: Vec<(Vec<u8>, String)> = timestamp
        .all_attestations()
        .into_iter()
        .filter_map(|(msg, attestation)| match attestation {
            Attestation::Pending { uri } => Some((msg, uri)),
            _ => None,
        })
        .collect();

    for (commitment, uri) in pending {
        if !whitelist.contains(&uri) {
            log::warn!("Ignoring attestation from calendar {uri}: not whitelisted");
            report.skipped += 1;
            continue;
        }

        let answer = match resolver.resolve(&uri) {
            Ok(calendar) => calendar.get_timestamp(&commitment).await,
            Err(e) => Err(e),
        };
        let answer = match answer {
            Ok(answer) => answer,
            Err(CalendarError::CommitmentNotFound) => {
                log::debug!("Calendar {uri}: {} not yet committed", hex::encode(&commitment));
                report.pending += 1;
                continue;
            }
            Err(e) => {
                log::warn!("Calendar {uri} upgrade failed: {e}");
                report.failed += 1;
                continue;
            }
        };

        let complete = answer
            .all_attestations()
            .iter()
            .any(|(_, a)| a.block().is_some());
        let merged = timestamp
            .find_mut(&commitment)
            .ok_or(TimestampError::MsgMismatch)
            .and_then(|node| node.merge(&answer));
        match merged {
            Ok(()) if complete => {
                log::info!("Upgraded timestamp via {uri}");
                report.upgraded += 1;
            }
            Ok(()) => report.pending += 1,
            Err(e) => {
                log::warn!("Calendar {uri} returned an unusable timestamp: {e}");
                report.failed += 1;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ots::op::Op;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Behavior {
        Answer(u8),
        Fail,
        Hang,
    }

    struct MockCalendar {
        url: String,
        behavior: Behavior,
        calls: AtomicUsize,
        upgrades: Mutex<HashMap<Vec<u8>, Timestamp>>,
    }

    impl MockCalendar {
        fn new(name: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                url: format!("https://{name}.calendar.opentimestamps.org"),
                behavior,
                calls: AtomicUsize::new(0),
                upgrades: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl Calendar for MockCalendar {
        fn url(&self) -> &str {
            &self.url
        }

        async fn submit(&self, digest: &[u8]) -> Result<Timestamp, CalendarError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Answer(salt) => {
                    let mut stamp = Timestamp::new(digest.to_vec());
                    stamp
                        .add_op(Op::Append(vec![salt]))
                        .unwrap()
                        .add_op(Op::Sha256)
                        .unwrap()
                        .add_attestation(Attestation::Pending {
                            uri: self.url.clone(),
                        });
                    Ok(stamp)
                }
                Behavior::Fail => Err(CalendarError::Http(500)),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn get_timestamp(&self, commitment: &[u8]) -> Result<Timestamp, CalendarError> {
            self.upgrades
                .lock()
                .unwrap()
                .get(commitment)
                .cloned()
                .ok_or(CalendarError::CommitmentNotFound)
        }
    }

    fn handles(calendars: &[Arc<MockCalendar>]) -> Vec<CalendarHandle> {
        calendars
            .iter()
            .map(|c| Arc::clone(c) as CalendarHandle)
            .collect()
    }

    #[test]
    fn test_default_quorum() {
        assert!(matches!(
            Stamper::new(Vec::new(), None),
            Err(StampError::NoCalendars)
        ));

        let one = [MockCalendar::new("a", Behavior::Fail)];
        assert_eq!(Stamper::new(handles(&one), None).unwrap().quorum(), 1);

        let three = [
            MockCalendar::new("a", Behavior::Fail),
            MockCalendar::new("b", Behavior::Fail),
            MockCalendar::new("c", Behavior::Fail),
        ];
        assert_eq!(Stamper::new(handles(&three), None).unwrap().quorum(), 3);
        assert_eq!(Stamper::new(handles(&three), Some(2)).unwrap().quorum(), 2);
        assert!(matches!(
            Stamper::new(handles(&three), Some(4)),
            Err(StampError::QuorumTooLarge {
                quorum: 4,
                calendars: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_quorum_reached_despite_hanging_calendar() {
        let calendars = [
            MockCalendar::new("a", Behavior::Answer(1)),
            MockCalendar::new("b", Behavior::Hang),
            MockCalendar::new("c", Behavior::Answer(2)),
        ];
        let stamper = Stamper::new(handles(&calendars), Some(2))
            .unwrap()
            .with_timeout(Duration::from_secs(30));

        let mut stamp = Timestamp::new(vec![0x55u8; 32]);
        let merged = stamper.stamp(&mut stamp).await.unwrap();
        assert_eq!(merged, 2);
        assert_eq!(stamp.ops().len(), 2);
        assert_eq!(stamp.all_attestations().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let calendars = [
            MockCalendar::new("a", Behavior::Answer(1)),
            MockCalendar::new("b", Behavior::Hang),
            MockCalendar::new("c", Behavior::Fail),
        ];
        let stamper = Stamper::new(handles(&calendars), Some(2))
            .unwrap()
            .with_timeout(Duration::from_millis(50));

        let mut stamp = Timestamp::new(vec![0x55u8; 32]);
        let err = stamper.stamp(&mut stamp).await.unwrap_err();
        assert!(matches!(
            err,
            StampError::QuorumFailure {
                succeeded: 1,
                required: 2
            }
        ));
        // the one success was still merged
        assert_eq!(stamp.all_attestations().len(), 1);
    }

    #[tokio::test]
    async fn test_single_worker_visits_every_calendar() {
        let calendars = [
            MockCalendar::new("a", Behavior::Fail),
            MockCalendar::new("b", Behavior::Fail),
            MockCalendar::new("c", Behavior::Answer(3)),
        ];
        let stamper = Stamper::new(handles(&calendars), Some(1))
            .unwrap()
            .with_workers(1);

        let mut stamp = Timestamp::new(vec![1u8; 32]);
        assert_eq!(stamper.stamp(&mut stamp).await.unwrap(), 1);
        for calendar in &calendars {
            assert_eq!(calendar.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_invalid_private_key_rejected() {
        let mut config = CalendarConfig::default();
        config.private.push(crate::config::PrivateCalendarConfig {
            url: "https://private.example.org".into(),
            signing_key: "abcd".into(),
        });
        assert!(matches!(
            Stamper::from_config(&config),
            Err(StampError::InvalidKey { .. })
        ));
    }

    struct MockResolver(Vec<Arc<MockCalendar>>);

    impl CalendarResolver for MockResolver {
        fn resolve(&self, uri: &str) -> Result<CalendarHandle, CalendarError> {
            self.0
                .iter()
                .find(|c| c.url == uri)
                .map(|c| Arc::clone(c) as CalendarHandle)
                .ok_or_else(|| CalendarError::Network(format!("unknown {uri}")))
        }
    }

    #[tokio::test]
    async fn test_upgrade_timestamp() {
        let alice = MockCalendar::new("alice", Behavior::Answer(1));
        let bob = MockCalendar::new("bob", Behavior::Answer(2));
        let mut stamp = Timestamp::new(vec![9u8; 32]);
        for calendar in [&alice, &bob] {
            stamp.merge(&calendar.submit(&[9u8; 32]).await.unwrap()).unwrap();
        }
        stamp.add_attestation(Attestation::Pending {
            uri: "https://evil.example.com".into(),
        });

        // alice has committed the message to a block, bob has not yet
        let commitment = Op::Sha256
            .apply(&Op::Append(vec![1]).apply(&[9u8; 32]).unwrap())
            .unwrap();
        let mut upgraded = Timestamp::new(commitment.clone());
        upgraded
            .add_op(Op::Sha256)
            .unwrap()
            .add_attestation(Attestation::BitcoinBlockHeader { height: 700_000 });
        alice.upgrades.lock().unwrap().insert(commitment, upgraded);

        let whitelist = UrlWhitelist::default();
        let resolver = MockResolver(vec![alice, bob]);
        let report = upgrade_timestamp(&mut stamp, &whitelist, &resolver).await;

        assert_eq!(
            report,
            UpgradeReport {
                upgraded: 1,
                pending: 1,
                skipped: 1,
                failed: 0
            }
        );
        assert!(report.changed());
        assert!(stamp.is_complete());
    }
}
