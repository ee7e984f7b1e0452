//! Free-function wrappers over the `metrics` macros, one per emitted
//! series, named `core_<crate>_<thing>` the way this workspace's other
//! metrics module names its `fc_*` series.

use core_common::{InstanceMetrics, QueueMetrics};
use core_net::PoolMetrics;
use metrics::{counter, gauge};

pub fn set_queue_metrics(m: &QueueMetrics) {
    gauge!("core_queue_current_size").set(m.current_size as f64);
    gauge!("core_queue_dead_letter_size").set(m.dead_letter_size as f64);
    gauge!("core_queue_events_being_processed").set(m.events_being_processed as f64);
    gauge!("core_queue_utilization_percent").set(m.utilization_percent);
    gauge!("core_queue_avg_wait_time_ms").set(m.avg_wait_time_ms);
    gauge!("core_queue_enqueue_rate").set(m.enqueue_rate);
    gauge!("core_queue_dequeue_rate").set(m.dequeue_rate);
    counter!("core_queue_total_enqueued").absolute(m.total_enqueued);
    counter!("core_queue_total_dequeued").absolute(m.total_dequeued);
    counter!("core_queue_total_dropped").absolute(m.total_dropped);
    counter!("core_queue_total_dead_lettered").absolute(m.total_dead_lettered);
}

pub fn set_pool_metrics(m: &PoolMetrics) {
    let pool = m.pool_name.clone();
    gauge!("core_net_pool_created_clients", "pool" => pool.clone()).set(m.created_clients as f64);
    gauge!("core_net_pool_idle_clients", "pool" => pool.clone()).set(m.idle_clients as f64);
    gauge!("core_net_pool_in_use", "pool" => pool.clone()).set(m.in_use as f64);
    gauge!("core_net_pool_max_connections", "pool" => pool.clone()).set(m.max_connections as f64);
    counter!("core_net_pool_total_requests", "pool" => pool.clone()).absolute(m.total_requests);
    counter!("core_net_pool_total_errors", "pool" => pool.clone()).absolute(m.total_errors);
    record_circuit_state(&pool, &format!("{:?}", m.circuit_state).to_uppercase());
}

pub fn set_instance_metrics(instance_id: &str, m: &InstanceMetrics) {
    let instance = instance_id.to_string();
    gauge!("core_registry_instance_cpu_percent", "instance" => instance.clone()).set(m.cpu_percent);
    gauge!("core_registry_instance_memory_percent", "instance" => instance.clone()).set(m.memory_percent);
    gauge!("core_registry_instance_error_rate", "instance" => instance.clone()).set(m.error_rate);
    gauge!("core_registry_instance_avg_response_time_ms", "instance" => instance.clone()).set(m.avg_response_time_ms);
    gauge!("core_registry_instance_queue_depth", "instance" => instance.clone()).set(m.queue_depth as f64);
    gauge!("core_registry_instance_events_processed_per_second", "instance" => instance)
        .set(m.events_processed_per_second);
}

pub fn record_scale_decision(kind: &str, count: u32, reason: &str) {
    counter!("core_scale_decisions_total", "kind" => kind.to_string()).increment(1);
    gauge!("core_scale_last_action_count").set(count as f64);
    tracing::info!(kind, count, reason, "autoscaler decision recorded");
}

pub fn record_health_transition(instance_id: &str, old: &str, new: &str) {
    counter!("core_health_transitions_total", "from" => old.to_string(), "to" => new.to_string()).increment(1);
    tracing::debug!(instance_id, old, new, "health transition recorded");
}

pub fn record_circuit_state(pool: &str, state: &str) {
    gauge!("core_net_circuit_open", "pool" => pool.to_string()).set(if state == "OPEN" { 1.0 } else { 0.0 });
}
