//! Drives the glasses' calibration workflow over their REST API.
//!
//! A session needs a project and a participant on the device before it can
//! calibrate. Calibration itself is started with two calls and then polled
//! until the device reports a terminal state. Polling is left to the caller
//! so it can be paced by the control loop.

use log::{info, warn};
use serde_json::{json, Value};
use std::{fmt, io};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    Created,
    Calibrating,
    Calibrated,
    Failed,
}

impl CalibrationState {
    /// Token reported on the output line when calibration finishes.
    pub fn status_code(&self) -> Option<&'static str> {
        match self {
            CalibrationState::Calibrated => Some("C"),
            CalibrationState::Failed => Some("F"),
            _ => None,
        }
    }
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CalibrationState::Idle => "idle",
            CalibrationState::Created => "created",
            CalibrationState::Calibrating => "calibrating",
            CalibrationState::Calibrated => "calibrated",
            CalibrationState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
pub enum CalibrationError {
    /// The request did not go through or the device answered with an error.
    Http(Box<ureq::Error>),

    /// The response body could not be read as JSON.
    Io(io::Error),

    /// A response did not carry the id the next call needs.
    MissingField(&'static str),
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CalibrationError::Http(error) => write!(f, "http error: {}", error),
            CalibrationError::Io(error) => write!(f, "bad response body: {}", error),
            CalibrationError::MissingField(name) => write!(f, "response has no '{}'", name),
        }
    }
}

impl std::error::Error for CalibrationError {}

impl From<ureq::Error> for CalibrationError {
    fn from(value: ureq::Error) -> Self {
        Self::Http(Box::new(value))
    }
}

impl From<io::Error> for CalibrationError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// JSON request/response calls against the device.
pub trait CalibrationTransport: Send {
    fn post(&mut self, path: &str, body: Option<&Value>) -> Result<Value, CalibrationError>;
    fn get(&mut self, path: &str) -> Result<Value, CalibrationError>;
}

/// [`CalibrationTransport`] over plain HTTP.
pub struct HttpTransport {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpTransport {
    /// `base_url` is the device root, e.g. `http://192.168.71.50`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: ureq::Agent::new(),
        }
    }
}

impl CalibrationTransport for HttpTransport {
    fn post(&mut self, path: &str, body: Option<&Value>) -> Result<Value, CalibrationError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(body.cloned().unwrap_or(Value::Null))?;
        Ok(response.into_json()?)
    }

    fn get(&mut self, path: &str) -> Result<Value, CalibrationError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .agent
            .get(&url)
            .set("Content-Type", "application/json")
            .call()?;
        Ok(response.into_json()?)
    }
}

fn id_field(value: &Value, name: &'static str) -> Result<String, CalibrationError> {
    match value.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(CalibrationError::MissingField(name)),
    }
}

pub struct CalibrationSession {
    transport: Box<dyn CalibrationTransport>,
    state: CalibrationState,
    project_id: Option<String>,
    participant_id: Option<String>,
    calibration_id: Option<String>,
}

impl CalibrationSession {
    pub fn new(transport: impl CalibrationTransport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            state: CalibrationState::Idle,
            project_id: None,
            participant_id: None,
            calibration_id: None,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    /// Create the project and participant every calibration hangs off.
    pub fn create(&mut self) -> Result<(), CalibrationError> {
        let project = self.transport.post("/api/projects", None)?;
        let project_id = id_field(&project, "pr_id")?;

        let participant = self
            .transport
            .post("/api/participants", Some(&json!({ "pa_project": project_id })))?;
        let participant_id = id_field(&participant, "pa_id")?;

        info!(
            "CalibrationSession : project {}, participant {}",
            project_id, participant_id
        );
        self.project_id = Some(project_id);
        self.participant_id = Some(participant_id);
        self.state = CalibrationState::Created;
        Ok(())
    }

    /// Start a new calibration, creating the session first if needed.
    pub fn start(&mut self) -> Result<(), CalibrationError> {
        let (project_id, participant_id) = match (&self.project_id, &self.participant_id) {
            (Some(pr), Some(pa)) => (pr.clone(), pa.clone()),
            _ => {
                self.create()?;
                return self.start();
            }
        };

        info!("CalibrationSession : starting calibration");
        let calibration = self.transport.post(
            "/api/calibrations",
            Some(&json!({
                "ca_project": project_id,
                "ca_type": "default",
                "ca_participant": participant_id,
            })),
        )?;
        let calibration_id = id_field(&calibration, "ca_id")?;

        self.transport
            .post(&format!("/api/calibrations/{}/start", calibration_id), None)?;

        self.calibration_id = Some(calibration_id);
        self.state = CalibrationState::Calibrating;
        Ok(())
    }

    /// Poll the device once. Returns the terminal state the first time it is
    /// reached, `None` otherwise. Does nothing unless calibrating.
    pub fn update(&mut self) -> Option<CalibrationState> {
        if self.state != CalibrationState::Calibrating {
            return None;
        }
        let calibration_id = self.calibration_id.as_ref()?;

        let path = format!("/api/calibrations/{}/status", calibration_id);
        let status = match self.transport.get(&path) {
            Ok(status) => status,
            Err(e) => {
                warn!("CalibrationSession : status poll failed: {}", e);
                return None;
            }
        };

        let next = match status.get("ca_state").and_then(Value::as_str) {
            Some("calibrated") => CalibrationState::Calibrated,
            Some("failed") => CalibrationState::Failed,
            _ => return None,
        };
        info!("CalibrationSession : {}", next);
        self.state = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    type CallLog = Arc<Mutex<Vec<(String, String, Option<Value>)>>>;

    /// Answers like the device would, with scripted status replies.
    struct ScriptedTransport {
        log: CallLog,
        statuses: VecDeque<Result<Value, CalibrationError>>,
        calibrations: u32,
        omit_project_id: bool,
    }

    impl ScriptedTransport {
        fn new(statuses: Vec<Result<Value, CalibrationError>>) -> (Self, CallLog) {
            let log = CallLog::default();
            let transport = Self {
                log: Arc::clone(&log),
                statuses: statuses.into(),
                calibrations: 0,
                omit_project_id: false,
            };
            (transport, log)
        }
    }

    impl CalibrationTransport for ScriptedTransport {
        fn post(&mut self, path: &str, body: Option<&Value>) -> Result<Value, CalibrationError> {
            self.log
                .lock()
                .unwrap()
                .push(("POST".to_string(), path.to_string(), body.cloned()));
            match path {
                "/api/projects" if self.omit_project_id => Ok(json!({})),
                "/api/projects" => Ok(json!({ "pr_id": "pr1" })),
                "/api/participants" => Ok(json!({ "pa_id": "pa1" })),
                "/api/calibrations" => {
                    self.calibrations += 1;
                    Ok(json!({ "ca_id": format!("ca{}", self.calibrations) }))
                }
                _ => Ok(json!({})),
            }
        }

        fn get(&mut self, path: &str) -> Result<Value, CalibrationError> {
            self.log
                .lock()
                .unwrap()
                .push(("GET".to_string(), path.to_string(), None));
            self.statuses
                .pop_front()
                .unwrap_or_else(|| Ok(json!({ "ca_state": "calibrating" })))
        }
    }

    fn state(s: &str) -> Result<Value, CalibrationError> {
        Ok(json!({ "ca_state": s }))
    }

    #[test]
    fn test_calibrates() {
        let (transport, log) =
            ScriptedTransport::new(vec![state("calibrating"), state("calibrating"), state("calibrated")]);
        let mut session = CalibrationSession::new(transport);
        assert_eq!(session.state(), CalibrationState::Idle);

        session.start().unwrap();
        assert_eq!(session.state(), CalibrationState::Calibrating);

        assert_eq!(session.update(), None);
        assert_eq!(session.update(), None);
        assert_eq!(session.update(), Some(CalibrationState::Calibrated));
        assert_eq!(session.state(), CalibrationState::Calibrated);

        // no longer calibrating, so no more polls
        assert_eq!(session.update(), None);

        let log = log.lock().unwrap();
        let calls: Vec<(&str, &str)> = log.iter().map(|(m, p, _)| (m.as_str(), p.as_str())).collect();
        assert_eq!(
            calls,
            vec![
                ("POST", "/api/projects"),
                ("POST", "/api/participants"),
                ("POST", "/api/calibrations"),
                ("POST", "/api/calibrations/ca1/start"),
                ("GET", "/api/calibrations/ca1/status"),
                ("GET", "/api/calibrations/ca1/status"),
                ("GET", "/api/calibrations/ca1/status"),
            ]
        );
        assert_eq!(log[1].2, Some(json!({ "pa_project": "pr1" })));
        assert_eq!(
            log[2].2,
            Some(json!({ "ca_project": "pr1", "ca_type": "default", "ca_participant": "pa1" }))
        );
    }

    #[test]
    fn test_failure_is_terminal() {
        let (transport, _log) = ScriptedTransport::new(vec![state("failed")]);
        let mut session = CalibrationSession::new(transport);
        session.start().unwrap();

        let done = session.update();
        assert_eq!(done, Some(CalibrationState::Failed));
        assert_eq!(done.and_then(|s| s.status_code()), Some("F"));
        assert_eq!(session.update(), None);
    }

    #[test]
    fn test_update_when_idle() {
        let (transport, log) = ScriptedTransport::new(vec![]);
        let mut session = CalibrationSession::new(transport);
        assert_eq!(session.update(), None);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_poll_errors_keep_calibrating() {
        let (transport, _log) = ScriptedTransport::new(vec![
            Err(CalibrationError::MissingField("ca_state")),
            state("calibrated"),
        ]);
        let mut session = CalibrationSession::new(transport);
        session.start().unwrap();

        assert_eq!(session.update(), None);
        assert_eq!(session.state(), CalibrationState::Calibrating);
        assert_eq!(session.update(), Some(CalibrationState::Calibrated));
    }

    #[test]
    fn test_recalibrate_reuses_session() {
        let (transport, log) = ScriptedTransport::new(vec![state("failed"), state("calibrated")]);
        let mut session = CalibrationSession::new(transport);

        session.create().unwrap();
        assert_eq!(session.state(), CalibrationState::Created);

        session.start().unwrap();
        assert_eq!(session.update(), Some(CalibrationState::Failed));

        session.start().unwrap();
        assert_eq!(session.update(), Some(CalibrationState::Calibrated));

        let log = log.lock().unwrap();
        let projects = log.iter().filter(|(_, p, _)| p == "/api/projects").count();
        assert_eq!(projects, 1);
        assert!(log.iter().any(|(_, p, _)| p == "/api/calibrations/ca2/status"));
    }

    #[test]
    fn test_missing_id() {
        let (mut transport, _log) = ScriptedTransport::new(vec![]);
        transport.omit_project_id = true;
        let mut session = CalibrationSession::new(transport);

        assert!(matches!(
            session.start(),
            Err(CalibrationError::MissingField("pr_id"))
        ));
        assert_eq!(session.state(), CalibrationState::Idle);
    }

    #[test]
    fn test_numeric_ids() {
        assert_eq!(id_field(&json!({ "ca_id": 42 }), "ca_id").unwrap(), "42");
    }
}
