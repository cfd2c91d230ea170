//! Configuration module
//!
//! Answers BootNotification and Heartbeat for every supported protocol
//! version. A boot that is not accepted blacklists all other actions for the
//! station until a later boot is accepted.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use clap::ValueEnum;
use serde_json::json;
use tracing::info;

use csms_core::{
    Cache, ConfigHandle, EventGroup, Message, MessageHandler, MessageSender, OcppVersion, BOOT_NOTIFICATION,
};
use csms_dispatch::{ActionBlacklist, DispatchError, HandlerTable, Module, ModuleSpec};
use csms_validator::OcppValidator;

pub const HEARTBEAT: &str = "Heartbeat";

/// Registration status handed to booting stations
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BootStatus {
    Accepted,
    Pending,
    Rejected,
}

impl BootStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootStatus::Accepted => "Accepted",
            BootStatus::Pending => "Pending",
            BootStatus::Rejected => "Rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSettings {
    pub status: BootStatus,
    /// Heartbeat interval (or retry interval when not accepted), seconds
    pub interval: u64,
}

impl Default for BootSettings {
    fn default() -> Self {
        Self {
            status: BootStatus::Accepted,
            interval: 60,
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn reply(module: &Module, message: &Message, payload: serde_json::Value) -> Result<(), DispatchError> {
    let confirmation = module.send_call_result_with_message(message, payload).await;
    if confirmation.success {
        Ok(())
    } else {
        Err(DispatchError::handler(
            confirmation.reason().unwrap_or("reply was not published"),
        ))
    }
}

pub fn handlers(settings: BootSettings, validator: Arc<OcppValidator>, blacklist: ActionBlacklist) -> HandlerTable {
    HandlerTable::builder()
        .on_versions(&OcppVersion::ALL, BOOT_NOTIFICATION, move |module, message| {
            let validator = validator.clone();
            let blacklist = blacklist.clone();
            async move {
                let identifier = message.identifier();
                let actions = validator.actions(message.protocol);
                if settings.status == BootStatus::Accepted {
                    blacklist.clear(&identifier, &actions).await;
                } else {
                    blacklist.blacklist_all_except_boot(&identifier, &actions).await;
                }
                info!("Boot of {} answered {}", identifier, settings.status.as_str());

                let payload = json!({
                    "status": settings.status.as_str(),
                    "currentTime": now(),
                    "interval": settings.interval,
                });
                reply(&module, &message, payload).await
            }
        })
        .on_versions(&OcppVersion::ALL, HEARTBEAT, |module, message| async move {
            reply(&module, &message, json!({ "currentTime": now() })).await
        })
        .build()
}

/// Start the Configuration module on the given bus endpoints
pub async fn start(
    settings: BootSettings,
    config: Arc<ConfigHandle>,
    cache: Arc<dyn Cache>,
    validator: Arc<OcppValidator>,
    sender: Arc<dyn MessageSender>,
    handler: Arc<dyn MessageHandler>,
) -> Result<Arc<Module>, DispatchError> {
    let spec = ModuleSpec::new(EventGroup::Configuration).with_requests([BOOT_NOTIFICATION, HEARTBEAT]);
    let blacklist = ActionBlacklist::new(cache.clone());
    Module::init(spec, handlers(settings, validator, blacklist), config, cache, sender, handler).await
}
