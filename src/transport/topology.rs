//! Exchange/queue naming rules (spec §3.4 / §6).
//!
//! Exchanges are fanout-by-default, one per logical message type. Queues are
//! one per receive endpoint. Everything is namespaced by a `cluster` prefix
//! to isolate environments on a shared broker.

/// `<cluster>:<name>` — the universal naming rule for exchanges and queues.
pub fn namespaced(cluster: &str, name: &str) -> String {
    format!("{cluster}:{name}")
}

/// The fanout exchange for a logical message type `T`.
pub fn exchange_for_type(cluster: &str, type_name: &str) -> String {
    namespaced(cluster, type_name)
}

/// The queue for a receive endpoint `Q`.
pub fn queue_for_endpoint(cluster: &str, endpoint: &str) -> String {
    namespaced(cluster, endpoint)
}

/// The auxiliary delayed exchange for endpoint `Q`'s redelivery.
pub fn delayed_exchange_for_endpoint(cluster: &str, endpoint: &str) -> String {
    format!("delayed.exchange.{}", namespaced(cluster, endpoint))
}

/// The error queue companion to endpoint `Q`.
pub fn error_queue_for_endpoint(cluster: &str, endpoint: &str) -> String {
    format!("{}_error", namespaced(cluster, endpoint))
}

/// Execute queue for a distributed routing-slip activity (spec §4.4).
pub fn activity_execute_queue(prefix: &str, activity_name: &str) -> String {
    format!("{prefix}_{}_execute", kebab(activity_name))
}

/// Compensate queue for a distributed routing-slip activity (spec §4.4).
pub fn activity_compensate_queue(prefix: &str, activity_name: &str) -> String {
    format!("{prefix}_{}_compensate", kebab(activity_name))
}

fn kebab(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i != 0 {
                out.push('-');
            }
            out.extend(ch.to_lowercase());
        } else if ch == '_' || ch == ' ' {
            out.push('-');
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespacing_prefixes_cluster() {
        assert_eq!(namespaced("prod", "OrderSubmitted"), "prod:OrderSubmitted");
        assert_eq!(exchange_for_type("prod", "OrderSubmitted"), "prod:OrderSubmitted");
        assert_eq!(queue_for_endpoint("prod", "order-saga"), "prod:order-saga");
    }

    #[test]
    fn delayed_and_error_names() {
        assert_eq!(
            delayed_exchange_for_endpoint("prod", "order-saga"),
            "delayed.exchange.prod:order-saga"
        );
        assert_eq!(
            error_queue_for_endpoint("prod", "order-saga"),
            "prod:order-saga_error"
        );
    }

    #[test]
    fn activity_queue_names_are_kebab_case() {
        assert_eq!(
            activity_execute_queue("rs", "ProcessPayment"),
            "rs_process-payment_execute"
        );
        assert_eq!(
            activity_compensate_queue("rs", "ProcessPayment"),
            "rs_process-payment_compensate"
        );
    }
}
