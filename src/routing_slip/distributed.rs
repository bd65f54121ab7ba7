//! Distributed (queue-dispatched) routing-slip execution (spec §4.4
//! "Distributed execution mode", §6 "Activity message shapes").
//!
//! Each step is dispatched as a request/reply over the same `Transport`
//! abstraction the saga runtime and consumer pipeline use, onto
//! per-activity queues named by `transport::topology::activity_execute_queue`/
//! `activity_compensate_queue`. This lets individual activities scale out
//! as separate consumer processes instead of running in the executor's
//! own process.

use super::{ActivityException, ActivityLog, CompensateLog, ItineraryRevision, RoutingSlip, SlipOutcome};
use crate::transport::{topology, Transport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// `{trackingNumber, activityName, executionId, args, variables, timestamp, correlationId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityExecute {
    pub tracking_number: String,
    pub activity_name: String,
    pub execution_id: String,
    pub args: serde_json::Value,
    pub variables: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ActivityResultType {
    Complete,
    Fault,
    Terminate,
}

/// `{trackingNumber, activityName, executionId, success, resultType, compensationLog?, variables?, error?, duration, timestamp, correlationId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityExecuteResponse {
    pub tracking_number: String,
    pub activity_name: String,
    pub execution_id: String,
    pub success: bool,
    pub result_type: ActivityResultType,
    #[serde(default)]
    pub compensation_log: Option<serde_json::Value>,
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    /// Steps to splice into the itinerary, present only when `resultType`
    /// reflects an itinerary revision.
    #[serde(default)]
    pub revision: Option<ItineraryRevision>,
}

/// `{trackingNumber, activityName, compensationLog, variables, timestamp, correlationId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCompensate {
    pub tracking_number: String,
    pub activity_name: String,
    #[serde(default)]
    pub compensation_log: Option<serde_json::Value>,
    pub variables: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}

/// `{trackingNumber, activityName, success, error?, timestamp, correlationId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCompensateResponse {
    pub tracking_number: String,
    pub activity_name: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}

/// Runs a routing slip's itinerary by dispatching each step onto the
/// activity's own execute/compensate queue rather than calling an
/// in-process `Activity` impl.
pub struct DistributedExecutor {
    transport: Arc<dyn Transport>,
    cluster: String,
    queue_prefix: String,
    reply_timeout: Duration,
}

impl DistributedExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        cluster: impl Into<String>,
        queue_prefix: impl Into<String>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            cluster: cluster.into(),
            queue_prefix: queue_prefix.into(),
            reply_timeout,
        }
    }

    pub async fn execute(&self, mut slip: RoutingSlip) -> (RoutingSlip, SlipOutcome) {
        let mut i = 0usize;
        loop {
            if i >= slip.itinerary.len() {
                return (slip, SlipOutcome::Completed);
            }

            let step = slip.itinerary[i].clone();
            let correlation_id = Uuid::new_v4().to_string();
            let request = ActivityExecute {
                tracking_number: slip.tracking_number.clone(),
                activity_name: step.name.clone(),
                execution_id: Uuid::new_v4().to_string(),
                args: step.args.clone(),
                variables: slip.variables.clone(),
                timestamp: Utc::now(),
                correlation_id: correlation_id.clone(),
            };

            let queue = topology::activity_execute_queue(&self.queue_prefix, &step.name);
            let envelope = crate::envelope::Envelope::new_publish_async(
                &self.cluster,
                "ActivityExecute",
                "routing-slip://executor",
                format!("queue://{queue}"),
                serde_json::to_value(&request).unwrap_or(serde_json::Value::Null),
                chrono::Duration::from_std(self.reply_timeout).unwrap_or(chrono::Duration::seconds(10)),
            );

            let reply = match self.transport.publish_async(envelope, self.reply_timeout).await {
                Ok(reply) => reply,
                Err(err) => {
                    let error = format!("activity execute request failed: {err}");
                    slip.activity_exceptions.push(ActivityException {
                        name: step.name.clone(),
                        timestamp: Utc::now(),
                        error: error.clone(),
                    });
                    self.run_compensation(&mut slip).await;
                    return (slip, SlipOutcome::Faulted);
                }
            };

            let response: ActivityExecuteResponse = match serde_json::from_value(reply.message) {
                Ok(response) => response,
                Err(err) => {
                    let error = format!("malformed activity execute response: {err}");
                    slip.activity_exceptions.push(ActivityException {
                        name: step.name.clone(),
                        timestamp: Utc::now(),
                        error: error.clone(),
                    });
                    self.run_compensation(&mut slip).await;
                    return (slip, SlipOutcome::Faulted);
                }
            };

            match response.result_type {
                ActivityResultType::Complete => {
                    slip.activity_logs.push(ActivityLog {
                        name: step.name.clone(),
                        timestamp: response.timestamp,
                        duration: response.duration,
                        compensation_log: response.compensation_log,
                    });
                    if let Some(vars) = response.variables {
                        merge(&mut slip.variables, vars);
                    }
                    if let Some(revision) = response.revision {
                        let insert_at = i + 1;
                        for (offset, revised_step) in revision.insert_next.into_iter().enumerate() {
                            slip.itinerary.insert(insert_at + offset, revised_step);
                        }
                    }
                    i += 1;
                }
                ActivityResultType::Fault => {
                    let error = response.error.unwrap_or_else(|| "activity faulted".to_string());
                    slip.activity_exceptions.push(ActivityException {
                        name: step.name.clone(),
                        timestamp: response.timestamp,
                        error,
                    });
                    self.run_compensation(&mut slip).await;
                    return (slip, SlipOutcome::Faulted);
                }
                ActivityResultType::Terminate => {
                    return (slip, SlipOutcome::Terminated);
                }
            }
        }
    }

    async fn run_compensation(&self, slip: &mut RoutingSlip) {
        let logs = slip.activity_logs.clone();
        for log in logs.into_iter().rev() {
            let correlation_id = Uuid::new_v4().to_string();
            let request = ActivityCompensate {
                tracking_number: slip.tracking_number.clone(),
                activity_name: log.name.clone(),
                compensation_log: log.compensation_log.clone(),
                variables: slip.variables.clone(),
                timestamp: Utc::now(),
                correlation_id: correlation_id.clone(),
            };

            let queue = topology::activity_compensate_queue(&self.queue_prefix, &log.name);
            let envelope = crate::envelope::Envelope::new_publish_async(
                &self.cluster,
                "ActivityCompensate",
                "routing-slip://executor",
                format!("queue://{queue}"),
                serde_json::to_value(&request).unwrap_or(serde_json::Value::Null),
                chrono::Duration::from_std(self.reply_timeout).unwrap_or(chrono::Duration::seconds(10)),
            );

            let (success, error) = match self.transport.publish_async(envelope, self.reply_timeout).await {
                Ok(reply) => match serde_json::from_value::<ActivityCompensateResponse>(reply.message) {
                    Ok(response) => (response.success, response.error),
                    Err(err) => (false, Some(err.to_string())),
                },
                Err(err) => (false, Some(err.to_string())),
            };

            if let Some(error) = &error {
                tracing::error!(activity = %log.name, %error, "distributed compensation failed");
            }
            slip.compensate_logs.push(CompensateLog {
                name: log.name.clone(),
                timestamp: Utc::now(),
                success,
                error,
            });
        }
    }
}

fn merge(target: &mut serde_json::Value, incoming: serde_json::Value) {
    match (target, incoming) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                target_map.insert(key, value);
            }
        }
        (target_slot, incoming_value) => {
            *target_slot = incoming_value;
        }
    }
}
