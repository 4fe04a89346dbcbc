use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ringrpc_common::registry::MethodDescriptor;
use ringrpc_common::{MethodId, Result, ServiceId};
use tracing::{info, warn};

use crate::executor::{DispatchExecutor, DispatchTask};

/// Executors of every published method, built once at server start.
///
/// Methods registered with `shared` set use one executor per group name;
/// the first method of a group decides its configuration.
#[derive(Default)]
pub struct ExecutorGroups {
    by_method: HashMap<(ServiceId, MethodId), DispatchExecutor>,
    executors: Vec<DispatchExecutor>,
}

impl ExecutorGroups {
    pub fn build<'a, I>(methods: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Arc<MethodDescriptor>>,
    {
        let mut groups = Self::default();
        let mut shared: HashMap<String, (DispatchExecutor, &'a Arc<MethodDescriptor>)> =
            HashMap::new();

        for method in methods {
            let config = method.executor();
            let executor = if config.shared {
                match shared.get(&config.group) {
                    Some((executor, first)) => {
                        if first.executor() != config {
                            warn!(
                                "Method {} joins group {} with a different executor configuration; using the one of {}",
                                method.name(),
                                config.group,
                                first.name()
                            );
                        }
                        executor.clone()
                    }
                    None => {
                        let executor = groups.create(format!("group-{}", config.group), method)?;
                        shared.insert(config.group.clone(), (executor.clone(), method));
                        executor
                    }
                }
            } else {
                groups.create(format!("{}.{}", method.service_id(), method.name()), method)?
            };
            groups
                .by_method
                .insert((method.service_id(), method.method_id()), executor);
        }

        Ok(groups)
    }

    fn create(&mut self, name: String, method: &MethodDescriptor) -> Result<DispatchExecutor> {
        match DispatchExecutor::new(name, method.executor()) {
            Ok(executor) => {
                self.executors.push(executor.clone());
                Ok(executor)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    pub fn get(&self, service_id: ServiceId, method_id: MethodId) -> Option<&DispatchExecutor> {
        self.by_method.get(&(service_id, method_id))
    }

    /// Distinct executors.
    pub fn executors(&self) -> &[DispatchExecutor] {
        &self.executors
    }

    /// Stops every executor from taking new tasks.
    pub fn close(&self) {
        for executor in &self.executors {
            executor.close();
        }
    }

    /// Closes every executor and gives them `timeout` in total to drain.
    ///
    /// # Returns
    ///
    /// Tasks still queued when time ran out.
    pub fn shutdown(&self, timeout: Duration) -> Vec<DispatchTask> {
        let deadline = Instant::now() + timeout;
        self.close();
        let leftovers: Vec<DispatchTask> = self
            .executors
            .iter()
            .flat_map(|executor| executor.shutdown(deadline))
            .collect();
        info!(
            "Stopped {} executors; {} tasks left undrained",
            self.executors.len(),
            leftovers.len()
        );
        leftovers
    }
}

impl Drop for ExecutorGroups {
    fn drop(&mut self) {
        self.close();
    }
}
