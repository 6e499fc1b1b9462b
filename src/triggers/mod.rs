//! Run triggers: cron schedules, folder watchers, webhooks.

pub mod cron;
pub mod scheduler;
pub mod watcher;
pub mod webhook;

pub use cron::CronExpr;
pub use scheduler::ScheduleRunner;
pub use watcher::{Debouncer, FolderWatcher, WatcherConfig};
pub use webhook::{WebhookGate, WebhookRejection};
