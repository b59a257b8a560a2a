use serde::{Deserialize, Serialize};

use crate::compose::{FieldLocator, FieldWriter};
use crate::driver::{AdvanceOutcome, DraftFillDriver, StartRequest};
use crate::personalize::TextGenerator;
use crate::session::{SavedData, SessionStatus};
use crate::store::KeyValueStore;

/// Messages accepted from the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Start(StartRequest),
    Advance,
    Reset,
    Status,
    SavedData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Outcome(AdvanceOutcome),
    Status(SessionStatus),
    Saved(SavedData),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    fn with_data(mut self, data: Payload) -> Self {
        self.data = Some(data);
        self
    }
}

impl<S, G, U> DraftFillDriver<S, G, U>
where
    S: KeyValueStore,
    G: TextGenerator,
    U: FieldLocator + FieldWriter + Send,
{
    /// Dispatch one trigger message. Failures are reported in the response.
    pub async fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::Ping => Response::ok("pong"),
            Request::Start(start) => match self.start(start).await {
                Ok(total) => match self.advance().await {
                    Ok(outcome) => Response::ok(format!(
                        "Ready to fill {} drafts. {}",
                        total,
                        outcome.message()
                    ))
                    .with_data(Payload::Outcome(outcome)),
                    Err(err) => Response::failed(format!(
                        "Session started with {} drafts, but the first row failed: {}",
                        total, err
                    )),
                },
                Err(err) => Response::failed(err),
            },
            Request::Advance => match self.advance().await {
                Ok(outcome) => Response::ok(outcome.message()).with_data(Payload::Outcome(outcome)),
                Err(err) => Response::failed(format!("Error filling draft: {}", err)),
            },
            Request::Reset => match self.reset().await {
                Ok(()) => Response::ok("Draft session reset"),
                Err(err) => Response::failed(err),
            },
            Request::Status => {
                let status = self.status();
                let message = if status.has_data {
                    format!(
                        "Row {}/{} ({} remaining)",
                        status.current_row, status.total_rows, status.remaining
                    )
                } else {
                    "No active draft session".to_string()
                };
                Response::ok(message).with_data(Payload::Status(status))
            }
            Request::SavedData => match self.saved_data().await {
                Ok(saved) => Response::ok("Saved data loaded").with_data(Payload::Saved(saved)),
                Err(err) => Response::failed(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_use_action_tag() {
        let request: Request = serde_json::from_str(r#"{"action":"advance"}"#).unwrap();
        assert_eq!(request, Request::Advance);

        let start: Request = serde_json::from_str(
            r#"{"action":"start","rows":[{"name":"Al","email":"a@x.com","company":"Acme"}],
                "templates":{"subject":"Hi [name]","body":"Re [company]"}}"#,
        )
        .unwrap();
        match start {
            Request::Start(start) => {
                assert_eq!(start.rows[0].name, "Al");
                assert!(start.attachments.is_empty());
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn failed_response_omits_empty_fields() {
        let json = serde_json::to_value(Response::failed("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "error": "boom"}));
    }
}
