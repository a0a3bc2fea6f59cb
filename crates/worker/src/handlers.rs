//! Demo handlers bundled with the worker binary.
//!
//! Each one validates its payload shape and echoes what it received, marked
//! `"demo": true`. They do no real work, so `taskq-worker run` only registers
//! them with `--demo-handlers`. Real deployments register their own handlers
//! for the same task types.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use taskq_core::{Payload, TaskType};
use taskq_infra::queue::{HandlerError, HandlerRegistry, RegistryError, handler_fn};

#[derive(Debug, Deserialize, Serialize)]
struct JobFetch {
    source: String,
    #[serde(default)]
    query: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct Matching {
    cv_id: String,
    #[serde(default)]
    job_ids: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct CsvGeneration {
    report: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct EmailDelivery {
    to: String,
    subject: String,
}

pub fn demo_registry() -> Result<HandlerRegistry, RegistryError> {
    HandlerRegistry::new()
        .with(
            TaskType::JobFetch,
            handler_fn(|payload: Payload| async move {
                let job: JobFetch = payload.decode()?;
                info!(source = %job.source, query = ?job.query, "demo job fetch");
                Ok::<_, HandlerError>(Payload::new(json!({ "demo": true, "source": job.source })))
            }),
        )?
        .with(
            TaskType::Matching,
            handler_fn(|payload: Payload| async move {
                let m: Matching = payload.decode()?;
                info!(cv_id = %m.cv_id, jobs = m.job_ids.len(), "demo matching");
                Ok::<_, HandlerError>(Payload::new(json!({ "demo": true, "cv_id": m.cv_id, "jobs": m.job_ids.len() })))
            }),
        )?
        .with(
            TaskType::CsvGeneration,
            handler_fn(|payload: Payload| async move {
                let csv: CsvGeneration = payload.decode()?;
                info!(report = %csv.report, "demo csv generation");
                Ok::<_, HandlerError>(Payload::new(json!({ "demo": true, "report": csv.report })))
            }),
        )?
        .with(
            TaskType::EmailDelivery,
            handler_fn(|payload: Payload| async move {
                let email: EmailDelivery = payload.decode()?;
                if !email.to.contains('@') {
                    return Err(HandlerError::new(format!("invalid recipient: {}", email.to)));
                }
                info!(to = %email.to, subject = %email.subject, "demo email delivery");
                Ok::<_, HandlerError>(Payload::new(json!({ "demo": true, "to": email.to })))
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_results_are_labelled() {
        let registry = demo_registry().unwrap();
        let handler = registry.get(TaskType::JobFetch).unwrap();
        let out = handler
            .handle(Payload::new(json!({ "source": "remote-ok" })))
            .await
            .unwrap();
        assert_eq!(out.as_json(), &json!({ "demo": true, "source": "remote-ok" }));
    }

    #[test]
    fn every_task_type_has_a_handler() {
        let registry = demo_registry().unwrap();
        assert!(registry.missing_types().is_empty());
        assert_eq!(registry.len(), TaskType::ALL.len());
    }

    #[tokio::test]
    async fn malformed_payload_is_a_handler_error() {
        let registry = demo_registry().unwrap();
        let handler = registry.get(TaskType::CsvGeneration).unwrap();
        let err = handler
            .handle(Payload::new(json!({ "rows": 3 })))
            .await
            .unwrap_err();
        assert!(err.message().contains("report"));
    }

    #[tokio::test]
    async fn email_handler_checks_recipient() {
        let registry = demo_registry().unwrap();
        let handler = registry.get(TaskType::EmailDelivery).unwrap();

        let err = handler
            .handle(Payload::new(json!({ "to": "nobody", "subject": "hi" })))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "invalid recipient: nobody");

        let ok = handler
            .handle(Payload::new(json!({ "to": "a@b.c", "subject": "hi" })))
            .await
            .unwrap();
        assert_eq!(ok.as_json()["demo"], true);
    }
}
