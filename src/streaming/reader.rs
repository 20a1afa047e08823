//! Consumer side of a stream.
//!
//! Runs on the caller's thread: `begin_step` pulls whatever the transport
//! has buffered into the [`WireDeserializer`] and advances to the next
//! complete step. One link is kept per writer rank.

use crate::config::{DeliveryMode, StreamConfig};
use crate::error::{Result, StreamError};
use crate::format::{copy_selection, PutOutcome, VarBlock, WireDeserializer};
use crate::logging;
use crate::monitor::{MonitorReport, StepMonitor};
use crate::streaming::channel::{POLL_INTERVAL, STEP_REQUEST};
use crate::streaming::{EngineContext, StepMode, StepStatus};
use crate::transport::{Requester, Subscriber, Transport};
use crate::types::{element_count, AttributeRegistry, Element, Variable};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Idle,
    StepActive,
    Closed,
}

enum Channel {
    Subscriber(Box<dyn Subscriber>),
    Requester {
        requester: Box<dyn Requester>,
        outstanding: bool,
    },
}

/// Connection to one writer rank.
struct Link {
    endpoint: String,
    channel: Channel,
    /// End-of-stream record received.
    ended: bool,
    /// Went away without an end-of-stream record.
    lost: bool,
}

impl Link {
    fn finished(&self) -> bool {
        self.ended || self.lost
    }

    fn request(&mut self) {
        if self.finished() {
            return;
        }
        if let Channel::Requester {
            requester,
            outstanding,
        } = &mut self.channel
        {
            if *outstanding {
                return;
            }
            match requester.send_request(Bytes::from_static(STEP_REQUEST)) {
                Ok(()) => *outstanding = true,
                // A replier that was reachable and is now gone will not return.
                Err(StreamError::Closed(e)) => {
                    debug!(endpoint = %self.endpoint, "replier gone: {}", e);
                    self.lost = true;
                }
                // The writer may not be up yet; retried on the next poll.
                Err(e) => trace!(endpoint = %self.endpoint, "request not sent: {}", e),
            }
        }
    }

    /// Messages that arrived within `timeout`, and whether the channel
    /// reported the writer gone. Whether that loses the link is decided by
    /// the caller once the messages were classified.
    fn poll(&mut self, timeout: Duration, allow_request: bool) -> (Vec<Bytes>, bool) {
        let mut messages = Vec::new();
        if self.finished() {
            return (messages, false);
        }
        if allow_request {
            self.request();
        }
        let mut disconnected = false;
        match &mut self.channel {
            Channel::Subscriber(subscriber) => {
                let mut wait = timeout;
                loop {
                    match subscriber.receive(wait) {
                        Ok(Some(message)) => messages.push(message),
                        Ok(None) => break,
                        Err(e) => {
                            debug!(endpoint = %self.endpoint, "subscriber closed: {}", e);
                            disconnected = true;
                            break;
                        }
                    }
                    wait = Duration::ZERO;
                }
            }
            Channel::Requester {
                requester,
                outstanding,
            } => {
                if !*outstanding {
                    return (messages, false);
                }
                match requester.receive_reply(timeout) {
                    Ok(Some(reply)) => {
                        *outstanding = false;
                        if reply.is_empty() {
                            // The writer let us go without more data.
                            disconnected = true;
                        } else {
                            messages.push(reply);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(endpoint = %self.endpoint, "requester closed: {}", e);
                        *outstanding = false;
                        disconnected = true;
                    }
                }
            }
        }
        (messages, disconnected)
    }
}

pub struct StreamReader {
    name: String,
    config: StreamConfig,
    context: EngineContext,
    deserializer: WireDeserializer,
    links: Vec<Link>,
    state: ReaderState,
    current_step: Option<u64>,
    current_blocks: Option<Arc<Vec<VarBlock>>>,
    monitor: Option<StepMonitor>,
}

impl StreamReader {
    /// Connect to every writer rank of `name`.
    pub fn open(
        name: &str,
        config: StreamConfig,
        transport: &dyn Transport,
        context: EngineContext,
    ) -> Result<Self> {
        config.validate()?;
        if config.verbosity > 0 {
            logging::init(config.verbosity);
        }
        let writers = context.topology.writer_ranks.max(1) as u32;
        let mut links = Vec::with_capacity(writers as usize);
        for rank in 0..writers {
            let endpoint = config.endpoint_for_rank(rank)?;
            let channel = match config.delivery {
                DeliveryMode::Fast => {
                    Channel::Subscriber(transport.open_subscriber(&endpoint, config.queue_depth)?)
                }
                DeliveryMode::Reliable => Channel::Requester {
                    requester: transport.open_requester(&endpoint, config.timeout())?,
                    outstanding: false,
                },
            };
            links.push(Link {
                endpoint,
                channel,
                ended: false,
                lost: false,
            });
        }
        for link in links.iter_mut() {
            link.request();
        }

        info!(
            stream = name,
            writers,
            delivery = ?config.delivery,
            "reader opened"
        );
        Ok(Self {
            name: name.to_string(),
            monitor: config.monitor.then(StepMonitor::new),
            config,
            context,
            deserializer: WireDeserializer::new(),
            links,
            state: ReaderState::Idle,
            current_step: None,
            current_blocks: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_step(&self) -> Option<u64> {
        self.current_step
    }

    pub fn monitor_report(&self) -> Option<MonitorReport> {
        self.monitor.as_ref().map(StepMonitor::report)
    }

    /// Advance to the next step. `timeout` of `None` waits indefinitely.
    pub fn begin_step(&mut self, mode: StepMode, timeout: Option<Duration>) -> Result<StepStatus> {
        self.ensure_open()?;
        if self.state == ReaderState::StepActive {
            return Err(StreamError::invalid(format!(
                "stream {}: begin_step while step {:?} is active",
                self.name, self.current_step
            )));
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            self.pump(Duration::ZERO, false)?;
            if let Some(step) = self.select_step(mode) {
                self.enter_step(step);
                return Ok(StepStatus::Ok);
            }
            if self.links.iter().all(Link::finished) {
                if self.links.iter().any(|l| l.lost) {
                    warn!(stream = %self.name, "a writer went away without ending the stream");
                    return Ok(StepStatus::OtherError);
                }
                debug!(
                    stream = %self.name,
                    final_step = ?self.deserializer.final_step(),
                    current = ?self.current_step,
                    "end of stream"
                );
                return Ok(StepStatus::EndOfStream);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(StepStatus::NotReady);
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            self.pump(wait, true)?;
        }
    }

    fn pump(&mut self, timeout: Duration, allow_request: bool) -> Result<()> {
        for link in self.links.iter_mut() {
            let (messages, disconnected) = link.poll(timeout, allow_request);
            for message in messages {
                match self.deserializer.put(message)? {
                    PutOutcome::EndOfStream { final_step } => {
                        debug!(endpoint = %link.endpoint, ?final_step, "end-of-stream record");
                        link.ended = true;
                    }
                    PutOutcome::Data { blocks, steps } => {
                        trace!(endpoint = %link.endpoint, blocks, ?steps, "data message");
                    }
                    PutOutcome::Empty => {}
                }
            }
            if disconnected && !link.ended {
                link.lost = true;
            }
        }
        Ok(())
    }

    /// Steps are complete once every writer rank contributed, or once no
    /// more data can arrive.
    fn select_step(&mut self, mode: StepMode) -> Option<u64> {
        let expected = self.links.len();
        let finished = self.links.iter().all(Link::finished);
        let candidates: Vec<u64> = self
            .deserializer
            .live_steps()
            .into_iter()
            .filter(|s| self.current_step.map_or(true, |c| *s > c))
            .collect();
        let complete = |step: &u64| finished || self.deserializer.step_ranks(*step) >= expected;

        let chosen = match mode {
            StepMode::NextAvailable => match self.config.delivery {
                // Best effort: an incomplete step may never complete.
                DeliveryMode::Fast => candidates.iter().copied().find(complete),
                DeliveryMode::Reliable => candidates.first().copied().filter(complete),
            },
            StepMode::LatestAvailable => candidates.iter().rev().copied().find(complete),
        }?;

        for skipped in candidates.iter().copied().take_while(|s| *s < chosen) {
            debug!(stream = %self.name, step = skipped, "skipping step");
            self.deserializer.erase(skipped);
        }
        Some(chosen)
    }

    fn enter_step(&mut self, step: u64) {
        let expected = self.current_step.map_or(0, |c| c + 1);
        let blocks = self.deserializer.get_meta_data(step);
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.record_dropped(step.saturating_sub(expected));
            if let Some(ts) = blocks
                .as_ref()
                .and_then(|b| b.iter().filter_map(|b| b.timestamp_ms).min())
            {
                monitor.record_timestamp(ts);
            }
        }
        self.current_step = Some(step);
        self.current_blocks = blocks;
        self.state = ReaderState::StepActive;
        trace!(stream = %self.name, step, "reader begin_step");
    }

    fn step_blocks(&self, op: &str) -> Result<&Arc<Vec<VarBlock>>> {
        self.ensure_open()?;
        match (&self.current_blocks, self.state) {
            (Some(blocks), ReaderState::StepActive) => Ok(blocks),
            _ => Err(StreamError::invalid(format!(
                "stream {}: {} outside begin_step/end_step",
                self.name, op
            ))),
        }
    }

    pub fn attributes(&self) -> AttributeRegistry {
        self.deserializer.attributes()
    }

    /// Variables present in the current step, described by their full box.
    pub fn available_variables(&self) -> BTreeMap<String, Variable> {
        let Some(blocks) = self.current_blocks.as_ref() else {
            return BTreeMap::new();
        };
        let mut variables = BTreeMap::new();
        for block in blocks.iter() {
            if !variables.contains_key(&block.name) {
                variables.insert(block.name.clone(), describe(block));
            }
        }
        variables
    }

    pub fn inquire_variable(&self, name: &str) -> Option<Variable> {
        self.current_blocks
            .as_ref()?
            .iter()
            .find(|b| b.name == name)
            .map(describe)
    }

    /// Number of blocks written for `name` in the current step.
    pub fn block_count(&self, name: &str) -> usize {
        self.current_blocks
            .as_ref()
            .map_or(0, |blocks| blocks.iter().filter(|b| b.name == name).count())
    }

    /// Copy the part of every block of `var` that falls inside its
    /// selection (`var.start`/`var.count`) into `dest`, row-major. Returns
    /// the bytes copied; blocks outside the selection contribute nothing.
    pub fn get(&self, var: &Variable, dest: &mut [u8]) -> Result<usize> {
        let blocks = self.step_blocks("get")?;
        let needed = var.payload_size();
        if dest.len() < needed {
            return Err(StreamError::invalid(format!(
                "variable {}: destination has {} bytes, selection needs {}",
                var.name,
                dest.len(),
                needed
            )));
        }
        let mut found = false;
        let mut copied = 0;
        for block in blocks.iter().filter(|b| b.name == var.name) {
            found = true;
            if block.data_type != var.data_type {
                return Err(StreamError::invalid(format!(
                    "variable {} is {}, requested as {}",
                    var.name,
                    block.data_type.as_str(),
                    var.data_type.as_str()
                )));
            }
            copied += self.copy_block(block, &var.start, &var.count, dest)?;
        }
        if !found {
            return Err(StreamError::invalid(format!(
                "variable {} not present in step {:?}",
                var.name, self.current_step
            )));
        }
        Ok(copied)
    }

    pub fn get_values<T: Element>(&self, var: &Variable) -> Result<Vec<T>> {
        if T::DATA_TYPE != var.data_type {
            return Err(StreamError::invalid(format!(
                "variable {} is {}, values are {}",
                var.name,
                var.data_type.as_str(),
                T::DATA_TYPE.as_str()
            )));
        }
        let mut bytes = vec![0u8; var.payload_size()];
        self.get(var, &mut bytes)?;
        let mut values = vec![T::default(); element_count(&var.count) as usize];
        T::fill_from_bytes(&bytes, &mut values);
        Ok(values)
    }

    /// Copy block `index` of `name` whole, in its own box.
    pub fn get_block(&self, name: &str, index: usize, dest: &mut [u8]) -> Result<usize> {
        let blocks = self.step_blocks("get_block")?;
        let block = blocks
            .iter()
            .filter(|b| b.name == name)
            .nth(index)
            .ok_or_else(|| {
                StreamError::invalid(format!("variable {} has no block {}", name, index))
            })?;
        self.copy_block(block, &block.start, &block.count, dest)
    }

    fn copy_block(&self, block: &VarBlock, start: &[u64], count: &[u64], dest: &mut [u8]) -> Result<usize> {
        let raw = self.deserializer.raw_buffer(block.buffer_key).ok_or_else(|| {
            StreamError::protocol(format!(
                "buffer of {} at step {} released while the step is live",
                block.name, block.step
            ))
        })?;
        let stored = &raw[block.position..block.position + block.size];

        let decoded;
        let payload: &[u8] = match &block.compression {
            Some(id) => {
                let operator = self.context.operators.get(id)?;
                decoded = operator
                    .inverse_operate(stored, block.decoded_size(), &block.params)
                    .map_err(|source| StreamError::Operator {
                        id: id.clone(),
                        source,
                    })?;
                if decoded.len() != block.decoded_size() {
                    return Err(StreamError::protocol(format!(
                        "block {} decoded to {} bytes, expected {}",
                        block.name,
                        decoded.len(),
                        block.decoded_size()
                    )));
                }
                &decoded
            }
            None => stored,
        };
        copy_selection(
            payload,
            &block.start,
            &block.count,
            block.layout,
            dest,
            start,
            count,
            block.data_type,
        )
    }

    /// Release the current step and, in reliable mode, ask for more.
    pub fn end_step(&mut self) -> Result<()> {
        self.ensure_open()?;
        let step = match (self.state, self.current_step) {
            (ReaderState::StepActive, Some(step)) => step,
            _ => {
                return Err(StreamError::invalid(format!(
                    "stream {}: end_step without an active step",
                    self.name
                )))
            }
        };
        if let (Some(monitor), Some(blocks)) = (self.monitor.as_mut(), self.current_blocks.as_ref()) {
            monitor.end_step(blocks.iter().map(|b| b.size as u64).sum());
        }
        self.current_blocks = None;
        self.deserializer.erase(step);
        self.state = ReaderState::Idle;
        for link in self.links.iter_mut() {
            link.request();
        }
        trace!(stream = %self.name, step, "reader end_step");
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.state == ReaderState::Closed {
            return Ok(());
        }
        self.state = ReaderState::Closed;
        self.current_blocks = None;
        self.deserializer.clear();
        self.links.clear();
        info!(stream = %self.name, last_step = ?self.current_step, "reader closed");
        if let Some(report) = self.monitor_report() {
            info!(stream = %self.name, ?report, "reader statistics");
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ReaderState::Closed {
            return Err(StreamError::Closed(self.name.clone()));
        }
        Ok(())
    }
}

fn describe(block: &VarBlock) -> Variable {
    let shape = block.shape.clone().unwrap_or_default();
    let (start, count) = if shape.is_empty() {
        (block.start.clone(), block.count.clone())
    } else {
        (vec![0; shape.len()], shape.clone())
    };
    Variable {
        name: block.name.clone(),
        data_type: block.data_type,
        shape,
        start,
        count,
        operator: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::{PutMode, StreamWriter};
    use crate::transport::MemoryTransport;
    use crate::types::{AttributeValue, DataType};

    fn config(address: &str) -> StreamConfig {
        StreamConfig {
            address: Some(address.to_string()),
            double_buffer: false,
            rendezvous_reader_count: 0,
            ..Default::default()
        }
    }

    fn wait() -> Option<Duration> {
        Some(Duration::from_secs(2))
    }

    fn write_steps(writer: &mut StreamWriter, steps: std::ops::Range<u64>) {
        let var = Variable::global("x", DataType::Double, vec![4], vec![0], vec![4]).unwrap();
        for step in steps {
            writer.begin_step().unwrap();
            let values: Vec<f64> = (0..4).map(|i| (step * 10 + i) as f64).collect();
            writer.put_values(&var, &values, PutMode::Sync).unwrap();
            writer.end_step().unwrap();
        }
    }

    #[test]
    fn test_reads_steps_in_order_then_end_of_stream() {
        let transport = MemoryTransport::new();
        let mut reader =
            StreamReader::open("s", config("r1"), &transport, EngineContext::default()).unwrap();
        let mut writer =
            StreamWriter::open("s", config("r1"), &transport, EngineContext::default()).unwrap();
        write_steps(&mut writer, 0..3);
        writer.close().unwrap();

        for step in 0..3u64 {
            assert_eq!(reader.begin_step(StepMode::NextAvailable, wait()).unwrap(), StepStatus::Ok);
            assert_eq!(reader.current_step(), Some(step));
            let var = reader.inquire_variable("x").unwrap();
            assert_eq!(var.shape, vec![4]);
            let values: Vec<f64> = reader.get_values(&var).unwrap();
            assert_eq!(values, vec![
                (step * 10) as f64,
                (step * 10 + 1) as f64,
                (step * 10 + 2) as f64,
                (step * 10 + 3) as f64
            ]);
            reader.end_step().unwrap();
        }
        assert_eq!(
            reader.begin_step(StepMode::NextAvailable, wait()).unwrap(),
            StepStatus::EndOfStream
        );
        reader.close().unwrap();
    }

    #[test]
    fn test_end_of_stream_after_publisher_thread_exits() {
        let transport = MemoryTransport::new();
        let threaded = StreamConfig {
            double_buffer: true,
            ..config("r7")
        };
        let mut reader =
            StreamReader::open("s", threaded.clone(), &transport, EngineContext::default()).unwrap();
        let mut writer =
            StreamWriter::open("s", threaded, &transport, EngineContext::default()).unwrap();
        write_steps(&mut writer, 0..3);
        // Joins the publish thread, which drops the publisher.
        writer.close().unwrap();

        let mut statuses = Vec::new();
        loop {
            let status = reader.begin_step(StepMode::NextAvailable, wait()).unwrap();
            statuses.push(status);
            if status != StepStatus::Ok {
                break;
            }
            reader.end_step().unwrap();
        }
        assert_eq!(
            statuses,
            vec![
                StepStatus::Ok,
                StepStatus::Ok,
                StepStatus::Ok,
                StepStatus::EndOfStream
            ]
        );
    }

    #[test]
    fn test_not_ready_within_timeout() {
        let transport = MemoryTransport::new();
        let mut reader =
            StreamReader::open("s", config("r2"), &transport, EngineContext::default()).unwrap();
        let _writer =
            StreamWriter::open("s", config("r2"), &transport, EngineContext::default()).unwrap();
        let status = reader
            .begin_step(StepMode::NextAvailable, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(status, StepStatus::NotReady);
        assert_eq!(reader.current_step(), None);
    }

    #[test]
    fn test_step_lifecycle_is_enforced() {
        let transport = MemoryTransport::new();
        let mut reader =
            StreamReader::open("s", config("r3"), &transport, EngineContext::default()).unwrap();
        let mut writer =
            StreamWriter::open("s", config("r3"), &transport, EngineContext::default()).unwrap();
        write_steps(&mut writer, 0..1);

        let var = Variable::global("x", DataType::Double, vec![4], vec![0], vec![4]).unwrap();
        let mut dest = vec![0u8; 32];
        assert!(reader.get(&var, &mut dest).is_err());
        assert!(reader.end_step().is_err());
        assert!(reader.inquire_variable("x").is_none());

        assert_eq!(reader.begin_step(StepMode::NextAvailable, wait()).unwrap(), StepStatus::Ok);
        assert!(reader.begin_step(StepMode::NextAvailable, wait()).is_err());

        let wrong_type = Variable::global("x", DataType::Float, vec![4], vec![0], vec![4]).unwrap();
        assert!(matches!(
            reader.get(&wrong_type, &mut dest),
            Err(StreamError::InvalidArgument(_))
        ));
        let missing = Variable::scalar("nope", DataType::Double);
        assert!(reader.get(&missing, &mut dest).is_err());
        assert!(reader.get(&var, &mut dest[..8]).is_err());
        assert_eq!(reader.get(&var, &mut dest).unwrap(), 32);

        reader.end_step().unwrap();
        reader.close().unwrap();
        assert!(matches!(
            reader.begin_step(StepMode::NextAvailable, wait()),
            Err(StreamError::Closed(_))
        ));
    }

    #[test]
    fn test_latest_available_skips_buffered_steps() {
        let transport = MemoryTransport::new();
        let mut cfg = config("r4");
        cfg.monitor = true;
        let mut reader = StreamReader::open("s", cfg, &transport, EngineContext::default()).unwrap();
        let mut writer =
            StreamWriter::open("s", config("r4"), &transport, EngineContext::default()).unwrap();
        write_steps(&mut writer, 0..5);

        assert_eq!(
            reader.begin_step(StepMode::LatestAvailable, wait()).unwrap(),
            StepStatus::Ok
        );
        assert_eq!(reader.current_step(), Some(4));
        reader.end_step().unwrap();

        let report = reader.monitor_report().unwrap();
        assert_eq!(report.steps, 1);
        assert_eq!(report.dropped_steps, 4);

        writer.close().unwrap();
        assert_eq!(
            reader.begin_step(StepMode::NextAvailable, wait()).unwrap(),
            StepStatus::EndOfStream
        );
    }

    #[test]
    fn test_publisher_gone_without_end_record() {
        let transport = MemoryTransport::new();
        let mut reader =
            StreamReader::open("s", config("r5"), &transport, EngineContext::default()).unwrap();
        let publisher = transport.open_publisher("r5").unwrap();
        drop(publisher);
        assert_eq!(
            reader.begin_step(StepMode::NextAvailable, wait()).unwrap(),
            StepStatus::OtherError
        );
    }

    #[test]
    fn test_local_blocks_and_attributes() {
        let transport = MemoryTransport::new();
        let mut reader =
            StreamReader::open("s", config("r6"), &transport, EngineContext::default()).unwrap();
        let mut writer =
            StreamWriter::open("s", config("r6"), &transport, EngineContext::default()).unwrap();
        writer.define_attribute("units", "kelvin").unwrap();

        let small = Variable::local("particles", DataType::Int32, vec![2]);
        let large = Variable::local("particles", DataType::Int32, vec![3]);
        writer.begin_step().unwrap();
        writer.put_values(&small, &[1i32, 2], PutMode::Sync).unwrap();
        writer.put_values(&large, &[3i32, 4, 5], PutMode::Deferred).unwrap();
        writer.end_step().unwrap();
        writer.close().unwrap();

        assert_eq!(reader.begin_step(StepMode::NextAvailable, wait()).unwrap(), StepStatus::Ok);
        assert_eq!(reader.block_count("particles"), 2);
        assert_eq!(reader.available_variables().len(), 1);

        let mut dest = vec![0u8; 12];
        assert_eq!(reader.get_block("particles", 1, &mut dest).unwrap(), 12);
        let mut values = [0i32; 3];
        i32::fill_from_bytes(&dest, &mut values);
        assert_eq!(values, [3, 4, 5]);
        assert!(reader.get_block("particles", 2, &mut dest).is_err());

        assert_eq!(
            reader.attributes().get("units"),
            Some(&AttributeValue::from("kelvin"))
        );
        reader.end_step().unwrap();
    }
}
