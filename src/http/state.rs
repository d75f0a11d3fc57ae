use std::sync::Arc;

use crate::config::Config;
use crate::driver::TranscoderDriver;
use crate::janitor::Janitor;
use crate::registry::JobRegistry;
use crate::scheduler::Scheduler;

/// Everything an HTTP handler needs, cloned cheaply per request. The
/// `Janitor` is held only so its background loops live as long as the
/// server; no handler ever touches it directly.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: JobRegistry,
    pub scheduler: Arc<Scheduler>,
    pub driver: Arc<TranscoderDriver>,
    pub janitor: Arc<Janitor>,
}
