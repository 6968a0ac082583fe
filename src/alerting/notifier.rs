/// 告警通知钩子
///
/// 引擎只保证每条告警调用一次 `notify`，投递方式由实现决定；
/// 通知失败只记录日志，不影响后续事件的阈值评估。
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::SecurityAlert;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook responded with status {0}")]
    Status(u16),
    #[error("notifier failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, alert: &SecurityAlert) -> Result<(), NotifyError>;
}

/// 写入日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, alert: &SecurityAlert) -> Result<(), NotifyError> {
        tracing::warn!(
            alert_id = %alert.id,
            event_type = %alert.event_type,
            severity = alert.severity.as_str(),
            ip = %alert.ip_address,
            auto_blocked = alert.auto_blocked,
            "🚨 安全告警: {}",
            alert.message
        );
        Ok(())
    }
}

/// JSON POST 到 Webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, alert: &SecurityAlert) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// 由宿主应用提供的回调
pub struct FnNotifier<F> {
    name: String,
    callback: F,
}

impl<F> FnNotifier<F>
where
    F: Fn(&SecurityAlert) -> Result<(), String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

#[async_trait]
impl<F> Notifier for FnNotifier<F>
where
    F: Fn(&SecurityAlert) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, alert: &SecurityAlert) -> Result<(), NotifyError> {
        (self.callback)(alert).map_err(NotifyError::Other)
    }
}
