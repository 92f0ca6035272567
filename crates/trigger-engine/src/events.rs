//! 引擎生命周期通知
//!
//! 基于 tokio broadcast 通道，没有订阅者时发布不会报错（通知直接丢弃）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// 生命周期通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    /// 开始处理事件
    EngineStart {
        event: String,
        candidates: usize,
        timestamp: DateTime<Utc>,
    },
    RuleMatched {
        rule_id: String,
        event: String,
        timestamp: DateTime<Utc>,
    },
    ActionSuccess {
        rule_id: String,
        action_type: String,
        result: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    ActionError {
        rule_id: String,
        action_type: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// 事件处理结束
    EngineDone {
        event: String,
        triggered: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RuleAdded {
        rule_id: String,
        timestamp: DateTime<Utc>,
    },
    RuleRemoved {
        rule_id: String,
        timestamp: DateTime<Utc>,
    },
    /// 规则集整体替换
    RulesUpdated {
        before: usize,
        after: usize,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// 通知类型名称
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EngineStart { .. } => "EngineStart",
            Self::RuleMatched { .. } => "RuleMatched",
            Self::ActionSuccess { .. } => "ActionSuccess",
            Self::ActionError { .. } => "ActionError",
            Self::EngineDone { .. } => "EngineDone",
            Self::RuleAdded { .. } => "RuleAdded",
            Self::RuleRemoved { .. } => "RuleRemoved",
            Self::RulesUpdated { .. } => "RulesUpdated",
        }
    }
}

/// 进程内通知总线
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 订阅之后发布的通知
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        // 仅在没有订阅者时失败，可以忽略
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_to_multiple_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(EngineEvent::RuleAdded {
            rule_id: "r1".to_string(),
            timestamp: Utc::now(),
        });

        assert_eq!(rx1.recv().await.unwrap().kind(), "RuleAdded");
        assert_eq!(rx2.recv().await.unwrap().kind(), "RuleAdded");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(EngineEvent::RulesUpdated {
            before: 0,
            after: 1,
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn test_serialized_shape() {
        let event = EngineEvent::ActionError {
            rule_id: "r1".to_string(),
            action_type: "WEBHOOK".to_string(),
            error: "timeout".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "ActionError");
        assert_eq!(json["ruleId"], "r1");
        assert_eq!(json["actionType"], "WEBHOOK");
    }
}
