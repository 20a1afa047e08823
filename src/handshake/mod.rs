//! Broker-free discovery of the writer and reader ranks of a named stream.
//!
//! Every process announces itself to every process in the pool, once per
//! stream it opens, tagging the announcement with its own stream slot. On
//! first use the coordinator posts one receive per (peer, slot) pair, so any
//! later stream on any peer lands in an already-posted receive.
//!
//! [`HandshakeCoordinator::wait`] polls those receives until, for the
//! stream, the expected number of applications (local-group masters) has
//! been seen and each of them has announced as many ranks as its group has.

pub mod announcement;
pub mod pool;

pub use announcement::{Announcement, StreamMode};
pub use pool::{LocalGroup, MemoryGroup, MemoryPool, PendingReceive, ProcessPool};

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const MIN_BACKOFF: Duration = Duration::from_micros(200);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Master rank -> individual ranks announced under it.
pub type RankMap = BTreeMap<u32, BTreeSet<u32>>;

#[derive(Debug, Clone)]
pub struct HandshakeSettings {
    /// Streams one process may open over its lifetime.
    pub max_streams: u32,
    pub max_filename_length: usize,
    /// Applications (writer groups plus reader groups) per stream.
    pub expected_app_count: usize,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            max_streams: 64,
            max_filename_length: 128,
            expected_app_count: 2,
            timeout: None,
        }
    }
}

impl HandshakeSettings {
    /// Defaults, with the timeout taken from `config`.
    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            timeout: config.handshake_timeout(),
            ..Default::default()
        })
    }
}

/// Summary of who takes part in a stream, valid after `wait` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTopology {
    pub writer_ranks: usize,
    pub reader_ranks: usize,
    pub writer_groups: usize,
    pub reader_groups: usize,
}

impl Default for StreamTopology {
    /// One writer rank, one reader rank.
    fn default() -> Self {
        Self {
            writer_ranks: 1,
            reader_ranks: 1,
            writer_groups: 1,
            reader_groups: 1,
        }
    }
}

#[derive(Default)]
struct State {
    /// Indexed by `slot * pool_size + peer`; `None` once completed.
    receives: Vec<Option<Box<dyn PendingReceive>>>,
    next_slot: u32,
    open_streams: usize,
    writers: HashMap<String, RankMap>,
    readers: HashMap<String, RankMap>,
    group_sizes: HashMap<String, BTreeMap<u32, u32>>,
}

/// Per-process discovery state shared by every stream the process opens.
pub struct HandshakeCoordinator {
    pool: Arc<dyn ProcessPool>,
    settings: HandshakeSettings,
    state: Mutex<State>,
}

impl HandshakeCoordinator {
    pub fn new(pool: Arc<dyn ProcessPool>, settings: HandshakeSettings) -> Self {
        Self {
            pool,
            settings,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn settings(&self) -> &HandshakeSettings {
        &self.settings
    }

    /// Announce this process as `mode` side of `stream`.
    ///
    /// Collective over `group`: every member must call it, since the group
    /// master's pool rank is broadcast from group rank 0.
    pub fn start(&self, mode: StreamMode, stream: &str, group: &dyn LocalGroup) -> Result<()> {
        if stream.len() > self.settings.max_filename_length {
            return Err(StreamError::config(format!(
                "stream name `{}` exceeds {} bytes",
                stream, self.settings.max_filename_length
            )));
        }

        let slot = {
            let mut state = self.lock();
            if state.next_slot >= self.settings.max_streams {
                return Err(StreamError::config(format!(
                    "process already opened {} streams, the limit",
                    self.settings.max_streams
                )));
            }
            if state.receives.is_empty() {
                self.post_receives(&mut state)?;
            }
            let slot = state.next_slot;
            state.next_slot += 1;
            state.open_streams += 1;
            slot
        };

        let master = group.broadcast_u32(self.pool.rank(), 0)?;
        let announcement = Announcement {
            mode,
            master,
            group_size: group.size(),
            stream: stream.to_string(),
        }
        .encode(self.settings.max_filename_length)?;

        for dest in 0..self.pool.size() {
            self.pool.isend(dest, slot, announcement.clone())?;
        }
        debug!(
            stream,
            ?mode,
            rank = self.pool.rank(),
            master,
            slot,
            "HandshakeCoordinator::start: announced"
        );
        Ok(())
    }

    fn post_receives(&self, state: &mut State) -> Result<()> {
        let size = self.pool.size();
        let mut receives = Vec::with_capacity((self.settings.max_streams * size) as usize);
        for slot in 0..self.settings.max_streams {
            for peer in 0..size {
                receives.push(Some(self.pool.post_receive(peer, slot)?));
            }
        }
        trace!(count = receives.len(), "HandshakeCoordinator: posted receives");
        state.receives = receives;
        Ok(())
    }

    /// Block until discovery of `stream` has converged.
    pub fn wait(&self, stream: &str) -> Result<()> {
        let deadline = self.settings.timeout.and_then(|t| Instant::now().checked_add(t));
        let mut backoff = MIN_BACKOFF;
        loop {
            {
                let mut state = self.lock();
                self.poll(&mut state)?;
                if self.converged(&state, stream) {
                    info!(
                        stream,
                        rank = self.pool.rank(),
                        writers = count_ranks(state.writers.get(stream)),
                        readers = count_ranks(state.readers.get(stream)),
                        "handshake complete"
                    );
                    return Ok(());
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let state = self.lock();
                    return Err(StreamError::Timeout(format!(
                        "stream `{}`: {} of {} applications announced",
                        stream,
                        self.masters(&state, stream).len(),
                        self.settings.expected_app_count
                    )));
                }
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn poll(&self, state: &mut State) -> Result<()> {
        let size = self.pool.size() as usize;
        let mut arrived = Vec::new();
        for (index, receive) in state.receives.iter_mut().enumerate() {
            let completed = match receive {
                Some(pending) => pending.test()?,
                None => None,
            };
            if let Some(raw) = completed {
                arrived.push(((index % size) as u32, raw));
                *receive = None;
            }
        }
        for (peer, raw) in arrived {
            match Announcement::decode(&raw) {
                Ok(a) => {
                    trace!(stream = %a.stream, mode = ?a.mode, master = a.master, peer, "announcement");
                    let maps = match a.mode {
                        StreamMode::Write => &mut state.writers,
                        StreamMode::Read => &mut state.readers,
                    };
                    maps.entry(a.stream.clone())
                        .or_default()
                        .entry(a.master)
                        .or_default()
                        .insert(peer);
                    state
                        .group_sizes
                        .entry(a.stream)
                        .or_default()
                        .insert(a.master, a.group_size);
                }
                Err(e) => warn!("HandshakeCoordinator: dropping malformed announcement: {}", e),
            }
        }
        Ok(())
    }

    fn masters(&self, state: &State, stream: &str) -> BTreeSet<u32> {
        let mut masters = BTreeSet::new();
        for maps in [&state.writers, &state.readers] {
            if let Some(map) = maps.get(stream) {
                masters.extend(map.keys().copied());
            }
        }
        masters
    }

    fn converged(&self, state: &State, stream: &str) -> bool {
        let masters = self.masters(state, stream);
        if masters.len() != self.settings.expected_app_count {
            return false;
        }
        let Some(sizes) = state.group_sizes.get(stream) else {
            return false;
        };
        masters.iter().all(|master| {
            let announced: usize = [&state.writers, &state.readers]
                .iter()
                .filter_map(|maps| maps.get(stream).and_then(|m| m.get(master)))
                .map(BTreeSet::len)
                .sum();
            sizes.get(master).map_or(false, |size| announced == *size as usize)
        })
    }

    /// Writer groups of `stream`. Meaningful once `wait` has returned.
    pub fn writer_map(&self, stream: &str) -> RankMap {
        self.lock().writers.get(stream).cloned().unwrap_or_default()
    }

    pub fn reader_map(&self, stream: &str) -> RankMap {
        self.lock().readers.get(stream).cloned().unwrap_or_default()
    }

    pub fn topology(&self, stream: &str) -> StreamTopology {
        let state = self.lock();
        let writers = state.writers.get(stream);
        let readers = state.readers.get(stream);
        StreamTopology {
            writer_ranks: count_ranks(writers),
            reader_ranks: count_ranks(readers),
            writer_groups: writers.map_or(0, BTreeMap::len),
            reader_groups: readers.map_or(0, BTreeMap::len),
        }
    }

    /// Release one stream. Returns true when this was the last open stream
    /// and all discovery state was torn down.
    pub fn finalize(&self) -> bool {
        let mut state = self.lock();
        state.open_streams = state.open_streams.saturating_sub(1);
        if state.open_streams > 0 {
            return false;
        }
        let mut cancelled = 0;
        for pending in state.receives.iter_mut().flatten() {
            pending.cancel();
            cancelled += 1;
        }
        debug!(cancelled, "HandshakeCoordinator::finalize: released");
        *state = State::default();
        true
    }
}

fn count_ranks(map: Option<&RankMap>) -> usize {
    map.map_or(0, |m| m.values().map(BTreeSet::len).sum())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solo(settings: HandshakeSettings) -> (HandshakeCoordinator, MemoryGroup) {
        let pool = MemoryPool::create(1).remove(0);
        let group = MemoryGroup::create(1).remove(0);
        (HandshakeCoordinator::new(Arc::new(pool), settings), group)
    }

    #[test]
    fn test_single_process_converges_on_itself() {
        let (hc, group) = solo(HandshakeSettings {
            expected_app_count: 1,
            ..Default::default()
        });
        hc.start(StreamMode::Write, "solo", &group).unwrap();
        hc.wait("solo").unwrap();
        assert_eq!(
            hc.topology("solo"),
            StreamTopology {
                writer_ranks: 1,
                reader_ranks: 0,
                writer_groups: 1,
                reader_groups: 0,
            }
        );
        assert_eq!(hc.writer_map("solo").get(&0).map(BTreeSet::len), Some(1));
    }

    #[test]
    fn test_settings_take_timeout_from_config() {
        let params: crate::types::Params = [("HandshakeTimeout".to_string(), "0.25".to_string())]
            .into_iter()
            .collect();
        let config = StreamConfig::from_params(&params).unwrap();
        let settings = HandshakeSettings::from_config(&config).unwrap();
        assert_eq!(settings.timeout, Some(Duration::from_millis(250)));
        assert_eq!(settings.expected_app_count, 2);

        // Only one of the two applications shows up.
        let (hc, group) = solo(settings);
        hc.start(StreamMode::Write, "lonely", &group).unwrap();
        let err = hc.wait("lonely").unwrap_err();
        assert!(matches!(err, StreamError::Timeout(_)));

        assert_eq!(
            HandshakeSettings::from_config(&StreamConfig::default())
                .unwrap()
                .timeout,
            None
        );
        let bad = StreamConfig {
            handshake_timeout_secs: Some(-1.0),
            ..Default::default()
        };
        assert!(HandshakeSettings::from_config(&bad).is_err());
    }

    #[test]
    fn test_huge_timeout_waits_without_overflow() {
        let (hc, group) = solo(HandshakeSettings {
            expected_app_count: 1,
            timeout: Some(Duration::MAX),
            ..Default::default()
        });
        hc.start(StreamMode::Read, "patient", &group).unwrap();
        hc.wait("patient").unwrap();
    }

    #[test]
    fn test_name_too_long() {
        let (hc, group) = solo(HandshakeSettings {
            max_filename_length: 4,
            ..Default::default()
        });
        let err = hc.start(StreamMode::Write, "too-long", &group).unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[test]
    fn test_slot_exhaustion() {
        let (hc, group) = solo(HandshakeSettings {
            max_streams: 2,
            expected_app_count: 1,
            ..Default::default()
        });
        hc.start(StreamMode::Write, "a", &group).unwrap();
        hc.start(StreamMode::Write, "b", &group).unwrap();
        let err = hc.start(StreamMode::Write, "c", &group).unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[test]
    fn test_timeout_when_peer_never_arrives() {
        let (hc, group) = solo(HandshakeSettings {
            expected_app_count: 2,
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        hc.start(StreamMode::Write, "lonely", &group).unwrap();
        assert!(matches!(hc.wait("lonely"), Err(StreamError::Timeout(_))));
    }

    #[test]
    fn test_finalize_counts_open_streams() {
        let (hc, group) = solo(HandshakeSettings {
            expected_app_count: 1,
            ..Default::default()
        });
        hc.start(StreamMode::Write, "a", &group).unwrap();
        hc.start(StreamMode::Read, "b", &group).unwrap();
        assert!(!hc.finalize());
        assert!(hc.finalize());
        assert!(hc.writer_map("a").is_empty());
    }
}
