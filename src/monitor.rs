//! 事件管道的消费者：持久化 -> 可疑度计分 -> 阈值评估
//!
//! 任何一步失败只记录日志，后续事件照常处理。

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

use crate::alerting::AlertEngine;
use crate::events::log::EventLog;
use crate::events::pipeline::EventProcessor;
use crate::events::SecurityEvent;
use crate::suspicion::SuspicionScorer;

pub struct SecurityMonitor {
    log: Arc<EventLog>,
    scorer: Arc<SuspicionScorer>,
    alerts: Arc<AlertEngine>,
}

impl SecurityMonitor {
    pub fn new(log: Arc<EventLog>, scorer: Arc<SuspicionScorer>, alerts: Arc<AlertEngine>) -> Self {
        Self {
            log,
            scorer,
            alerts,
        }
    }
}

#[async_trait]
impl EventProcessor for SecurityMonitor {
    async fn process(&self, event: SecurityEvent) {
        debug!(
            "处理安全事件 {} ({}, ip={})",
            event.id, event.event_type, event.ip_address
        );

        // 未持久化的事件不参与阈值计数
        if let Err(e) = self.log.append(&event).await {
            error!("❌ 写入安全事件 {} 失败: {}", event.id, e);
            return;
        }

        if let Err(e) = self.scorer.record(&event).await {
            error!("❌ 更新 IP {} 可疑度失败: {}", event.ip_address, e);
        }

        if let Err(e) = self.alerts.evaluate(&event).await {
            error!("❌ 评估事件 {} 告警阈值失败: {}", event.id, e);
        }
    }
}
