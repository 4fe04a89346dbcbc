//! Accept path: turns decoded frames into dispatch tasks or direct answers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ringrpc_common::registry::ServiceRegistry;
use ringrpc_common::{ErrorKind, Fault, Frame, Header, RingRpcError, TypeId, Value};
use tracing::{debug, info, warn};

use crate::connection::ServerConnection;
use crate::executor::{DelayWorker, DispatchTask, ExecutorGroups, Submit};

fn stopping_fault() -> Fault {
    Fault::new(ErrorKind::RpcServerStopping, "server shutting down")
}

/// Routes frames from every connection of a server.
///
/// | Frame type | Action |
/// |------------|--------|
/// | `OBJECT`, `EMPTY` | resolve, decode the parameter, submit to the method's executor |
/// | `HEARTBEAT` | echo |
/// | `METADATA` | answer with the service's published metadata |
/// | `NORMAL`, `ABNORMAL` | `NotSupportType` |
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    executors: ExecutorGroups,
    delay: DelayWorker,
    stopping: AtomicBool,
}

impl Dispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, executors: ExecutorGroups, delay: DelayWorker) -> Self {
        Self {
            registry,
            executors,
            delay,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn executors(&self) -> &ExecutorGroups {
        &self.executors
    }

    pub fn delay(&self) -> &DelayWorker {
        &self.delay
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Handles one inbound frame. Never blocks on a handler.
    pub fn dispatch(&self, conn: &Arc<ServerConnection>, frame: Frame) {
        let header = frame.header;
        match header.type_id {
            TypeId::Heartbeat => {
                debug!("Heartbeat from {}", conn.peer());
                conn.send_frame(&Frame::empty(header));
            }
            TypeId::Metadata => self.answer_metadata(conn, header),
            TypeId::Object | TypeId::Empty => self.submit(conn, frame),
            TypeId::Normal | TypeId::Abnormal => {
                warn!(
                    "{} sent a {} frame for {}",
                    conn.peer(),
                    header.type_id,
                    header.request_ref()
                );
                conn.send_fault(
                    header,
                    &Fault::new(
                        ErrorKind::NotSupportType,
                        format!("{} frames are not accepted by a server", header.type_id),
                    ),
                );
            }
        }
    }

    /// Decides whether the reader keeps going after a decode failure.
    ///
    /// Failures tied to a request are answered and reading continues; an
    /// oversized frame has already been skipped. Anything else ends the
    /// connection.
    pub fn on_error(&self, conn: &Arc<ServerConnection>, err: RingRpcError) -> bool {
        if let Some(request) = err.request() {
            warn!("Bad frame from {}: {}", conn.peer(), err);
            let header = Header::new(
                request.service_id,
                request.request_id,
                request.method_id,
                TypeId::Abnormal,
            );
            conn.send_fault(header, &err.into_fault());
            return true;
        }
        match err {
            RingRpcError::FrameTooLarge { size, max } => {
                warn!(
                    "Skipped {} byte frame from {} (limit {})",
                    size,
                    conn.peer(),
                    max
                );
                true
            }
            other => {
                warn!("Dropping connection {}: {}", conn.peer(), other);
                false
            }
        }
    }

    fn answer_metadata(&self, conn: &Arc<ServerConnection>, header: Header) {
        let Some(service) = self.registry.service(header.service_id) else {
            warn!(
                "{} probed unknown service {}",
                conn.peer(),
                header.service_id
            );
            conn.send_fault(
                header,
                &Fault::new(
                    ErrorKind::NotExistServiceId,
                    format!("service {} is not published here", header.service_id),
                ),
            );
            return;
        };

        match service.metadata().encode() {
            Ok(body) => {
                debug!("Sending metadata of {} to {}", service.name(), conn.peer());
                conn.send_frame(&Frame::new(header.with_type(TypeId::Metadata), body));
            }
            Err(e) => {
                warn!("Could not encode metadata of {}: {}", service.name(), e);
                conn.send_fault(header, &e.into_fault());
            }
        }
    }

    fn submit(&self, conn: &Arc<ServerConnection>, frame: Frame) {
        let header = frame.header;
        if self.is_stopping() {
            conn.send_fault(header, &stopping_fault());
            return;
        }

        let (Some(method), Some(executor)) = (
            self.registry.lookup(header.service_id, header.method_id),
            self.executors.get(header.service_id, header.method_id),
        ) else {
            debug!("No method for {} from {}", header.request_ref(), conn.peer());
            conn.send_fault(
                header,
                &Fault::new(
                    ErrorKind::NotExistServiceId,
                    format!(
                        "no method {} on service {}",
                        header.method_id, header.service_id
                    ),
                ),
            );
            return;
        };

        let parameter = if header.type_id == TypeId::Empty {
            Value::Empty
        } else {
            match method.parameter_serializer().deserialize(&frame.body) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        "Undecodable parameter for {} from {}: {}",
                        header.request_ref(),
                        conn.peer(),
                        e
                    );
                    conn.send_fault(
                        header,
                        &Fault::new(ErrorKind::SerializerError, e.to_string()),
                    );
                    return;
                }
            }
        };

        let task = DispatchTask::new(header, method, parameter, conn.clone());
        match executor.submit(task) {
            Submit::Accepted => {}
            Submit::Rejected(task) => self.delay.add(task, executor.clone()),
            Submit::Stopping(task) => {
                task.connection().gate().close();
                task.fail(&stopping_fault());
            }
        }
    }

    /// Stops taking requests, then drains the delay list and the executors.
    ///
    /// Blocks for up to `drain_timeout`; run it off the I/O threads.
    ///
    /// # Returns
    ///
    /// The number of requests answered with `RpcServerStopping`.
    pub fn shutdown(&self, drain_timeout: Duration) -> usize {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let parked = self.delay.len();
        self.delay.close();

        let leftovers = self.executors.shutdown(drain_timeout);
        let undrained = leftovers.len();
        let fault = stopping_fault();
        for task in leftovers {
            task.fail(&fault);
        }
        info!(
            "Dispatcher stopped; {} delayed and {} queued requests refused",
            parked, undrained
        );
        parked + undrained
    }
}
