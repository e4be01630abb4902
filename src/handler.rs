//! Top-level supervisor: the ordered set of services.
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::notifier::Notifier;
use crate::service::{Service, ServiceStatus};

/// Owns every service and exposes the supervisor's outward API.
///
/// Operations taking a name list target every service when the list is
/// absent or empty; multi-service operations are dispatched concurrently
/// and return as soon as the dispatch has occurred.
pub struct Handler {
    config: Config,
    services: Vec<Arc<Service>>,
    notifier: Option<Notifier>,
}

impl Handler {
    /// Builds one service per configuration entry, in declaration order.
    pub fn new(config: Config) -> Self {
        let notifier = config.email.clone().map(Notifier::new);
        let services = config
            .services
            .iter()
            .map(|service| Service::new(service.clone(), notifier.clone()))
            .collect();

        Self {
            config,
            services,
            notifier,
        }
    }

    /// The configuration the handler currently runs.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn select(&self, names: Option<&[String]>) -> Vec<Arc<Service>> {
        match names {
            None | Some([]) => self.services.clone(),
            Some(names) => self
                .services
                .iter()
                .filter(|service| names.iter().any(|name| name == service.name()))
                .cloned()
                .collect(),
        }
    }

    /// Dispatches a start for the selected services.
    pub fn start(&self, names: Option<&[String]>) {
        debug!("starting services: {:?}", names.unwrap_or_default());
        for service in self.select(names) {
            tokio::spawn(async move { service.start().await });
        }
    }

    /// Dispatches a stop for the selected services.
    pub fn stop(&self, names: Option<&[String]>) {
        for service in self.select(names) {
            tokio::spawn(async move { service.stop().await });
        }
    }

    /// Dispatches a restart for the selected services.
    pub fn restart(&self, names: Option<&[String]>) {
        for service in self.select(names) {
            tokio::spawn(async move { service.restart().await });
        }
    }

    /// Dispatches `autostart` for every service.
    pub fn autostart(&self) {
        info!("autostarting services");
        for service in self.services.clone() {
            tokio::spawn(async move { service.autostart().await });
        }
    }

    /// Swaps in a new configuration.
    ///
    /// Services missing from the new configuration are deleted, survivors
    /// are reloaded with their new entry, and new entries are constructed;
    /// the resulting list follows the new configuration's declaration
    /// order. Finishes by dispatching `autostart` across the new set.
    pub async fn reload(&mut self, config: Config) {
        info!("reloading configuration");
        self.notifier = config.email.clone().map(Notifier::new);

        let mut existing: HashMap<String, Arc<Service>> = HashMap::new();
        for service in self.services.drain(..) {
            existing.insert(service.name().to_string(), service);
        }

        let keep: Vec<&str> = config.services.iter().map(|s| s.name.as_str()).collect();
        for (name, service) in &existing {
            if !keep.contains(&name.as_str()) {
                service.delete().await;
            }
        }

        let mut services = Vec::with_capacity(config.services.len());
        for entry in &config.services {
            match existing.remove(&entry.name) {
                Some(service) => {
                    service.set_config(entry.clone());
                    service.set_notifier(self.notifier.clone());
                    service.reload().await;
                    services.push(service);
                }
                None => services.push(Service::new(entry.clone(), self.notifier.clone())),
            }
        }

        self.services = services;
        self.config = config;
        self.autostart();
    }

    /// Status of every service, in declaration order.
    pub fn status(&self) -> Vec<ServiceStatus> {
        self.services.iter().map(|service| service.status()).collect()
    }

    /// Deletes every service.
    pub async fn delete(&mut self) {
        for service in self.services.drain(..) {
            service.delete().await;
        }
        debug!("handler deleted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoRestart, ServiceConfig, StopSignal};
    use crate::worker::WorkerState;

    fn service_config(name: &str, cmd: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            cmd: cmd.to_string(),
            numprocs: 1,
            umask: 22,
            workingdir: "/tmp".to_string(),
            autostart: false,
            autorestart: AutoRestart::Never,
            exitcodes: vec![0],
            startretries: 1,
            starttime: 0,
            stopsignal: StopSignal::Term,
            stoptime: 1,
            stdout: None,
            stderr: None,
            user: None,
            env: HashMap::new(),
        }
    }

    fn config(services: Vec<ServiceConfig>) -> Config {
        Config {
            email: None,
            services,
        }
    }

    #[tokio::test]
    async fn status_preserves_declaration_order() {
        let handler = Handler::new(config(vec![
            service_config("b", "/bin/sleep 5"),
            service_config("a", "/bin/sleep 5"),
        ]));

        let names: Vec<String> = handler.status().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn selection_matches_names() {
        let handler = Handler::new(config(vec![
            service_config("a", "/bin/sleep 5"),
            service_config("b", "/bin/sleep 5"),
        ]));

        let all = handler.select(None);
        assert_eq!(all.len(), 2);
        let none = handler.select(Some(&[]));
        assert_eq!(none.len(), 2);
        let only_b = handler.select(Some(&["b".to_string()]));
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].name(), "b");
    }

    #[tokio::test]
    async fn reload_adds_and_removes_services() {
        let mut handler = Handler::new(config(vec![
            service_config("a", "/bin/sleep 5"),
            service_config("b", "/bin/sleep 5"),
        ]));

        handler
            .reload(config(vec![
                service_config("b", "/bin/sleep 5"),
                service_config("c", "/bin/sleep 5"),
            ]))
            .await;

        let names: Vec<String> = handler.status().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn delete_empties_the_handler() {
        let mut handler = Handler::new(config(vec![service_config("a", "/bin/sleep 5")]));
        handler.delete().await;
        assert!(handler.status().is_empty());
    }

    #[tokio::test]
    async fn new_service_after_reload_is_stopped() {
        let mut handler = Handler::new(config(vec![service_config("a", "/bin/sleep 5")]));
        handler
            .reload(config(vec![
                service_config("a", "/bin/sleep 5"),
                service_config("c", "/bin/sleep 5"),
            ]))
            .await;

        let status = handler.status();
        assert_eq!(status[1].name, "c");
        assert_eq!(status[1].workers, vec![WorkerState::Stopped]);
    }
}
