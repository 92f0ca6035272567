//! 指标记录模块
//!
//! 基于 metrics facade 记录引擎指标。未安装 recorder 时所有记录均为空操作，
//! 导出方式（Prometheus 等）由宿主程序决定。

/// 注册指标描述信息
pub fn describe_metrics() {
    metrics::describe_counter!("events_processed_total", "Total number of processed events");
    metrics::describe_histogram!(
        "event_processing_duration_seconds",
        "Event processing duration in seconds"
    );

    metrics::describe_counter!("rule_evaluations_total", "Total number of rule evaluations");
    metrics::describe_histogram!(
        "rule_evaluation_duration_seconds",
        "Rule evaluation duration in seconds"
    );

    metrics::describe_counter!(
        "action_executions_total",
        "Total number of executed actions by type and status"
    );

    metrics::describe_counter!(
        "state_operations_total",
        "Total number of state store operations"
    );
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录事件处理
#[inline]
pub fn record_event_processed(event: &str, triggered: usize, duration_secs: f64) {
    metrics::counter!(
        "events_processed_total",
        "event" => event.to_string(),
        "triggered" => (triggered > 0).to_string()
    )
    .increment(1);

    metrics::histogram!(
        "event_processing_duration_seconds",
        "event" => event.to_string()
    )
    .record(duration_secs);
}

/// 记录规则评估
#[inline]
pub fn record_rule_evaluation(matched: bool, duration_secs: f64) {
    metrics::counter!(
        "rule_evaluations_total",
        "matched" => matched.to_string()
    )
    .increment(1);

    metrics::histogram!("rule_evaluation_duration_seconds").record(duration_secs);
}

/// 记录动作执行（status: success / error / skipped）
#[inline]
pub fn record_action_execution(action_type: &str, status: &str) {
    metrics::counter!(
        "action_executions_total",
        "type" => action_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录状态存储操作
#[inline]
pub fn record_state_operation(operation: &'static str) {
    metrics::counter!("state_operations_total", "operation" => operation).increment(1);
}
