use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use ringrpc_common::registry::MethodDescriptor;
use ringrpc_common::{ErrorKind, Fault, Header, Value};
use tracing::{error, warn};

use crate::connection::ServerConnection;

/// One decoded request waiting for an executor thread.
pub struct DispatchTask {
    header: Header,
    method: Arc<MethodDescriptor>,
    parameter: Value,
    conn: Arc<ServerConnection>,
    /// Times this task went through the delay list
    attempts: u32,
}

impl DispatchTask {
    pub fn new(
        header: Header,
        method: Arc<MethodDescriptor>,
        parameter: Value,
        conn: Arc<ServerConnection>,
    ) -> Self {
        Self {
            header,
            method,
            parameter,
            conn,
            attempts: 0,
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn method(&self) -> &Arc<MethodDescriptor> {
        &self.method
    }

    pub fn connection(&self) -> &Arc<ServerConnection> {
        &self.conn
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Invokes the handler and writes the answer to the originating connection.
    ///
    /// A handler panic is answered with `ServerError`; a result the return
    /// serializer cannot encode is answered with `SerializerError`.
    pub fn run(self) {
        let DispatchTask {
            header,
            method,
            parameter,
            conn,
            ..
        } = self;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| method.invoke(parameter)));
        match outcome {
            Ok(Ok(value)) => {
                if let Err(e) = conn.send_value(header, method.return_serializer(), &value) {
                    warn!(
                        "Could not encode result of {} for {}: {}",
                        method.name(),
                        header.request_ref(),
                        e
                    );
                    conn.send_fault(header, &Fault::new(ErrorKind::SerializerError, e.to_string()));
                }
            }
            Ok(Err(fault)) => {
                conn.send_fault(header, &fault);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    "Handler {} panicked on {}: {}",
                    method.name(),
                    header.request_ref(),
                    message
                );
                conn.send_fault(header, &Fault::new(ErrorKind::ServerError, message));
            }
        }
    }

    /// Answers the request with `fault` without running it.
    pub fn fail(self, fault: &Fault) {
        self.conn.send_fault(self.header, fault);
    }
}

impl std::fmt::Debug for DispatchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTask")
            .field("request", &self.header.request_ref())
            .field("method", &self.method.name())
            .field("connection", &self.conn.id())
            .field("attempts", &self.attempts)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
