//! Producer side of a stream.
//!
//! Puts are buffered in a [`WireSerializer`]; every K-th `end_step` seals
//! the buffer into one message and hands it to the delivery path. Sealing
//! and delivery never block `begin_step` or `put`.

use crate::config::{DeliveryMode, StreamConfig};
use crate::error::{Result, StreamError};
use crate::format::WireSerializer;
use crate::logging;
use crate::monitor::{MonitorReport, StepMonitor};
use crate::streaming::channel::{
    outgoing_channel, DeliveryCounters, Outgoing, OutgoingReceiver, OutgoingSender,
    POLL_INTERVAL, STEP_REQUEST,
};
use crate::streaming::{EngineContext, StepStatus};
use crate::transport::{Publisher, Replier, Transport};
use crate::types::{AttributeRegistry, AttributeValue, Element, Variable};
use bytes::Bytes;
use crossbeam_channel::RecvTimeoutError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// When a put's payload is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutMode {
    /// Immediately.
    #[default]
    Sync,
    /// At the next `perform_puts` or `end_step`.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Idle,
    StepActive,
    Closed,
}

enum Delivery {
    /// Fast mode without double buffering: publish inside `end_step`.
    Inline {
        publisher: Box<dyn Publisher>,
        warned: bool,
    },
    /// A publish or reply thread drains the queue.
    Threaded {
        tx: Option<OutgoingSender>,
        handle: Option<JoinHandle<()>>,
        shutdown: Arc<AtomicBool>,
    },
}

pub struct StreamWriter {
    name: String,
    config: StreamConfig,
    context: EngineContext,
    serializer: WireSerializer,
    attributes: AttributeRegistry,
    attributes_sent: bool,
    deferred: Vec<(Variable, Vec<u8>)>,
    state: WriterState,
    current_step: Option<u64>,
    batch_steps: usize,
    batch_first_step: u64,
    step_start_size: usize,
    enqueued: u64,
    delivery: Delivery,
    counters: Arc<DeliveryCounters>,
    monitor: Option<StepMonitor>,
}

impl StreamWriter {
    /// Bind the delivery endpoint for `name` and start the delivery thread.
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
        let endpoint = config.endpoint_for_rank(context.rank)?;
        if context.topology.writer_ranks > 1 {
            warn!(
                stream = name,
                writers = context.topology.writer_ranks,
                "stream opened by several writer ranks; steps are not coordinated across them"
            );
        }

        let counters = Arc::new(DeliveryCounters::new());
        let delivery = match config.delivery {
            DeliveryMode::Fast => {
                let publisher = transport.open_publisher(&endpoint)?;
                wait_for_subscribers(name, publisher.as_ref(), &config);
                if config.double_buffer {
                    let (tx, rx) = outgoing_channel(config.queue_depth);
                    let stream = name.to_string();
                    let thread_counters = counters.clone();
                    let handle = thread::Builder::new()
                        .name(format!("publish-{}", name))
                        .spawn(move || publish_loop(&stream, publisher, rx, &thread_counters))?;
                    Delivery::Threaded {
                        tx: Some(tx),
                        handle: Some(handle),
                        shutdown: Arc::new(AtomicBool::new(false)),
                    }
                } else {
                    Delivery::Inline {
                        publisher,
                        warned: false,
                    }
                }
            }
            DeliveryMode::Reliable => {
                let replier =
                    transport.open_replier(&endpoint, config.timeout(), config.queue_depth)?;
                let (tx, rx) = outgoing_channel(config.queue_depth);
                let shutdown = Arc::new(AtomicBool::new(false));
                let stream = name.to_string();
                let thread_counters = counters.clone();
                let thread_shutdown = shutdown.clone();
                let steps_per_release = config.aggregation_factor as u64;
                let handle = thread::Builder::new()
                    .name(format!("reply-{}", name))
                    .spawn(move || {
                        reply_loop(
                            &stream,
                            replier,
                            rx,
                            &thread_counters,
                            steps_per_release,
                            &thread_shutdown,
                        )
                    })?;
                Delivery::Threaded {
                    tx: Some(tx),
                    handle: Some(handle),
                    shutdown,
                }
            }
        };

        info!(
            stream = name,
            endpoint = %endpoint,
            rank = context.rank,
            delivery = ?config.delivery,
            aggregation = config.aggregation_factor,
            "writer opened"
        );

        Ok(Self {
            name: name.to_string(),
            serializer: WireSerializer::new(context.rank, context.operators.clone()),
            monitor: config.monitor.then(StepMonitor::new),
            config,
            context,
            attributes: AttributeRegistry::new(),
            attributes_sent: false,
            deferred: Vec::new(),
            state: WriterState::Idle,
            current_step: None,
            batch_steps: 0,
            batch_first_step: 0,
            step_start_size: 0,
            enqueued: 0,
            delivery,
            counters,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> u32 {
        self.context.rank
    }

    /// The step most recently begun.
    pub fn current_step(&self) -> Option<u64> {
        self.current_step
    }

    pub fn counters(&self) -> &DeliveryCounters {
        &self.counters
    }

    pub fn monitor_report(&self) -> Option<MonitorReport> {
        self.monitor.as_ref().map(StepMonitor::report)
    }

    /// Attributes travel once, with the first step.
    pub fn define_attribute(&mut self, name: &str, value: impl Into<AttributeValue>) -> Result<()> {
        self.ensure_open()?;
        if self.attributes_sent {
            warn!(
                stream = %self.name,
                attribute = name,
                "attribute defined after the first step will not reach readers"
            );
        }
        self.attributes.insert(name.to_string(), value.into());
        Ok(())
    }

    pub fn begin_step(&mut self) -> Result<StepStatus> {
        self.ensure_open()?;
        if self.state == WriterState::StepActive {
            return Err(StreamError::invalid(format!(
                "stream {}: begin_step while step {:?} is active",
                self.name, self.current_step
            )));
        }
        let step = self.current_step.map_or(0, |s| s + 1);
        if self.batch_steps == 0 {
            self.serializer.new_buffer();
            self.batch_first_step = step;
        }
        self.current_step = Some(step);
        self.step_start_size = self.serializer.local_buffer_size();
        self.state = WriterState::StepActive;
        trace!(stream = %self.name, step, "writer begin_step");
        Ok(StepStatus::Ok)
    }

    /// Buffer one block of native-endian bytes for `var`.
    pub fn put(&mut self, var: &Variable, payload: &[u8], mode: PutMode) -> Result<()> {
        let step = self.active_step("put")?;
        match mode {
            PutMode::Sync => self.serializer.put(var, step, payload),
            PutMode::Deferred => {
                if payload.len() != var.payload_size() {
                    return Err(StreamError::invalid(format!(
                        "variable {}: payload has {} bytes, selection needs {}",
                        var.name,
                        payload.len(),
                        var.payload_size()
                    )));
                }
                self.deferred.push((var.clone(), payload.to_vec()));
                Ok(())
            }
        }
    }

    pub fn put_values<T: Element>(&mut self, var: &Variable, values: &[T], mode: PutMode) -> Result<()> {
        if T::DATA_TYPE != var.data_type {
            return Err(StreamError::invalid(format!(
                "variable {} is {}, values are {}",
                var.name,
                var.data_type.as_str(),
                T::DATA_TYPE.as_str()
            )));
        }
        let mut bytes = Vec::new();
        T::extend_bytes(values, &mut bytes);
        self.put(var, &bytes, mode)
    }

    /// Serialize every deferred put of the active step.
    pub fn perform_puts(&mut self) -> Result<()> {
        let step = self.active_step("perform_puts")?;
        for (var, payload) in std::mem::take(&mut self.deferred) {
            self.serializer.put(&var, step, &payload)?;
        }
        Ok(())
    }

    pub fn end_step(&mut self) -> Result<()> {
        let step = self.active_step("end_step")?;
        self.perform_puts()?;

        if !self.attributes_sent {
            self.serializer.attach_attributes(&self.attributes);
            self.attributes_sent = true;
        }
        self.serializer.attach_timestamp(step);
        self.batch_steps += 1;

        let step_bytes = self.serializer.local_buffer_size() - self.step_start_size;
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.end_step(step_bytes as u64);
        }
        self.state = WriterState::Idle;

        if self.batch_steps >= self.config.aggregation_factor {
            self.flush_batch()?;
        }
        trace!(stream = %self.name, step, bytes = step_bytes, "writer end_step");
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<()> {
        let last_step = self.current_step.unwrap_or(0);
        let buffer = self.serializer.get_local_pack();
        debug!(
            stream = %self.name,
            first_step = self.batch_first_step,
            last_step,
            bytes = buffer.len(),
            "sealed message"
        );
        self.batch_steps = 0;
        self.enqueue(Outgoing::Data {
            buffer,
            first_step: self.batch_first_step,
            last_step,
        })
    }

    fn enqueue(&mut self, message: Outgoing) -> Result<()> {
        match &mut self.delivery {
            Delivery::Inline { publisher, warned } => {
                publish(&self.name, publisher.as_ref(), &message, &self.counters, warned);
            }
            Delivery::Threaded { tx, .. } => {
                let tx = tx
                    .as_ref()
                    .ok_or_else(|| StreamError::Closed(self.name.clone()))?;
                tx.send(message).map_err(|_| {
                    StreamError::transport(format!("stream {}: delivery thread exited", self.name))
                })?;
            }
        }
        self.enqueued += 1;
        Ok(())
    }

    /// Flush any partial batch, send the end-of-stream record and wait for
    /// delivery to finish.
    pub fn close(&mut self) -> Result<()> {
        if self.state == WriterState::Closed {
            return Ok(());
        }
        if self.state == WriterState::StepActive {
            warn!(stream = %self.name, step = ?self.current_step, "closing with an active step; ending it");
            self.end_step()?;
        }
        if self.batch_steps > 0 {
            self.flush_batch()?;
        }
        let final_step = self.current_step;
        self.enqueue(Outgoing::End {
            buffer: WireSerializer::end_signal(final_step),
            final_step,
        })?;
        self.state = WriterState::Closed;

        if self.config.delivery == DeliveryMode::Reliable {
            self.drain();
        }
        if let Delivery::Threaded {
            tx,
            handle,
            shutdown,
        } = &mut self.delivery
        {
            shutdown.store(true, Ordering::Release);
            drop(tx.take());
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    warn!(stream = %self.name, "delivery thread panicked");
                }
            }
        }

        info!(
            stream = %self.name,
            final_step = ?final_step,
            messages = self.counters.released(),
            sent_steps = self.counters.sent_steps(),
            bytes = self.counters.bytes(),
            "writer closed"
        );
        if let Some(report) = self.monitor_report() {
            info!(stream = %self.name, ?report, "writer statistics");
        }
        Ok(())
    }

    /// Wait until every enqueued message has been pulled by a reader. With a
    /// drain timeout configured, give up once readers pulled nothing for
    /// that long.
    fn drain(&self) {
        let limit = self.config.drain_timeout();
        let mut released = self.counters.released();
        let mut last_progress = Instant::now();
        while released < self.enqueued {
            if let Delivery::Threaded {
                handle: Some(handle),
                ..
            } = &self.delivery
            {
                if handle.is_finished() {
                    warn!(stream = %self.name, "reply thread exited before draining");
                    return;
                }
            }
            thread::sleep(POLL_INTERVAL);
            let now = self.counters.released();
            if now != released {
                released = now;
                last_progress = Instant::now();
            } else if limit.map_or(false, |limit| last_progress.elapsed() > limit) {
                warn!(
                    stream = %self.name,
                    pending = self.enqueued - released,
                    "no reader pulled the remaining messages; giving up"
                );
                return;
            }
        }
        debug!(stream = %self.name, sent_steps = self.counters.sent_steps(), "drained");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == WriterState::Closed {
            return Err(StreamError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn active_step(&self, op: &str) -> Result<u64> {
        self.ensure_open()?;
        match (self.state, self.current_step) {
            (WriterState::StepActive, Some(step)) => Ok(step),
            _ => Err(StreamError::invalid(format!(
                "stream {}: {} outside begin_step/end_step",
                self.name, op
            ))),
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.state != WriterState::Closed {
            if let Err(e) = self.close() {
                warn!(stream = %self.name, "close on drop failed: {}", e);
            }
        }
    }
}

/// Give readers a chance to connect before the first step goes out.
fn wait_for_subscribers(stream: &str, publisher: &dyn Publisher, config: &StreamConfig) {
    let deadline = Instant::now().checked_add(config.timeout());
    while publisher.subscriber_count() < config.rendezvous_reader_count {
        if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            warn!(
                stream,
                expected = config.rendezvous_reader_count,
                connected = publisher.subscriber_count(),
                "rendezvous reader count not reached; early steps may be missed"
            );
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

// =============================================================================
// Delivery threads
// =============================================================================

fn publish(
    stream: &str,
    publisher: &dyn Publisher,
    message: &Outgoing,
    counters: &DeliveryCounters,
    warned: &mut bool,
) {
    let bytes = message.buffer().len();
    let steps = match message {
        Outgoing::Data {
            first_step,
            last_step,
            ..
        } => last_step - first_step + 1,
        Outgoing::End { .. } => 0,
    };
    match publisher.send(message.buffer().clone()) {
        Ok(0) => {
            counters.record_drop();
            if !*warned {
                warn!(stream, "no subscriber accepted the message; dropping it");
                *warned = true;
            } else {
                debug!(stream, bytes, "message dropped");
            }
        }
        Ok(subscribers) => {
            counters.record_release(bytes, steps);
            trace!(stream, bytes, subscribers, "published");
        }
        Err(e) => {
            counters.record_drop();
            warn!(stream, "publish failed: {}", e);
        }
    }
}

fn publish_loop(
    stream: &str,
    publisher: Box<dyn Publisher>,
    rx: OutgoingReceiver,
    counters: &DeliveryCounters,
) {
    let mut warned = false;
    for message in rx.iter() {
        publish(stream, publisher.as_ref(), &message, counters, &mut warned);
    }
    debug!(stream, "publish thread finished");
}

fn reply_loop(
    stream: &str,
    mut replier: Box<dyn Replier>,
    rx: OutgoingReceiver,
    counters: &DeliveryCounters,
    steps_per_release: u64,
    shutdown: &AtomicBool,
) {
    // A message whose reply failed is offered again on the next request.
    let mut pending: Option<Outgoing> = None;
    while !shutdown.load(Ordering::Acquire) {
        let request = match replier.receive_request(POLL_INTERVAL) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) if e.is_fatal() => {
                warn!(stream, "reply channel failed: {}", e);
                break;
            }
            Err(e) => {
                debug!(stream, "receive_request: {}", e);
                continue;
            }
        };

        if request.as_ref() != STEP_REQUEST {
            warn!(stream, request = ?request, "unexpected request");
            if let Err(e) = replier.send_reply(Bytes::new()) {
                debug!(stream, "reply to unexpected request failed: {}", e);
            }
            continue;
        }

        let message = match pending.take() {
            Some(message) => Some(message),
            None => next_queued(&rx, shutdown),
        };
        let Some(message) = message else {
            // Shutting down with nothing left; let the reader go.
            if let Err(e) = replier.send_reply(Bytes::new()) {
                debug!(stream, "final empty reply failed: {}", e);
            }
            break;
        };

        match replier.send_reply(message.buffer().clone()) {
            Ok(()) => {
                counters.record_release(message.buffer().len(), steps_per_release);
                trace!(
                    stream,
                    end = message.is_end(),
                    sent_steps = counters.sent_steps(),
                    "released message"
                );
            }
            Err(e) => {
                warn!(stream, "reply failed, keeping message for the next request: {}", e);
                pending = Some(message);
            }
        }
    }
    // Readers still waiting on a request learn that nothing more is coming.
    while let Ok(Some(_)) = replier.receive_request(Duration::ZERO) {
        if replier.send_reply(Bytes::new()).is_err() {
            break;
        }
    }
    debug!(stream, "reply thread finished");
}

fn next_queued(rx: &OutgoingReceiver, shutdown: &AtomicBool) -> Option<Outgoing> {
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(message) => return Some(message),
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Acquire) {
                    return None;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}
