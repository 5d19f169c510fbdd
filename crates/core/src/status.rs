//! Status enums for jobs, workflows and operation instances, with their
//! state machines.
//!
//! Each variant's discriminant is the SMALLINT stored in the database, so
//! the numbering must never change once persisted.

use crate::error::CoreError;

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:expr => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Every variant, in discriminant order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Look up a variant by its database status ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( x if x == $val => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Upper-case label, e.g. `"RUNNING"`.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $label ),+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case($label) {
                        return Ok($name::$variant);
                    }
                )+
                Err(CoreError::Validation(format!(
                    "Unknown {} '{s}'",
                    stringify!($name)
                )))
            }
        }
    };
}

define_status_enum! {
    /// Lifecycle of a dispatched job.
    JobStatus {
        Queued = 1 => "QUEUED",
        Running = 2 => "RUNNING",
        Finished = 3 => "FINISHED",
        Failed = 4 => "FAILED",
    }
}

define_status_enum! {
    /// Workflow-level state.
    WorkflowState {
        Instantiated = 1 => "INSTANTIATED",
        Running = 2 => "RUNNING",
        Paused = 3 => "PAUSED",
        Stopped = 4 => "STOPPED",
        Succeeded = 5 => "SUCCEEDED",
        Failed = 6 => "FAILED",
        Failing = 7 => "FAILING",
    }
}

define_status_enum! {
    /// State of a single operation instance inside a workflow.
    OperationState {
        Instantiated = 1 => "INSTANTIATED",
        Running = 2 => "RUNNING",
        Paused = 3 => "PAUSED",
        Succeeded = 4 => "SUCCEEDED",
        Failed = 5 => "FAILED",
        Skipped = 6 => "SKIPPED",
    }
}

// ---------------------------------------------------------------------------
// State machines
// ---------------------------------------------------------------------------

impl JobStatus {
    /// Statuses reachable from `self`.
    ///
    /// `QUEUED -> QUEUED` re-targets a job to another host before it starts,
    /// `RUNNING -> RUNNING` is a liveness touch. Terminal statuses return an
    /// empty slice.
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Queued => &[Queued, Running, Failed],
            Running => &[Running, Finished, Failed],
            Finished | Failed => &[],
        }
    }

    pub fn can_transition(self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// Validate a transition, returning [`CoreError::IllegalState`] for
    /// invalid ones.
    pub fn validate_transition(self, to: JobStatus) -> Result<(), CoreError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(CoreError::IllegalState(format!(
                "Invalid job transition: {self} -> {to}"
            )))
        }
    }
}

impl WorkflowState {
    /// States reachable from `self`.
    pub fn valid_transitions(self) -> &'static [WorkflowState] {
        use WorkflowState::*;
        match self {
            Instantiated => &[Running, Succeeded, Stopped],
            Running => &[Running, Paused, Failing, Failed, Succeeded, Stopped],
            Paused => &[Running, Stopped],
            Failing => &[Failing, Failed, Stopped],
            Stopped | Succeeded | Failed => &[],
        }
    }

    pub fn can_transition(self, to: WorkflowState) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// `SUCCEEDED`, `FAILED` and `STOPPED` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Stopped | WorkflowState::Succeeded | WorkflowState::Failed
        )
    }

    /// States in which the engine is (or should be) driving operations.
    pub fn is_active(self) -> bool {
        matches!(self, WorkflowState::Running | WorkflowState::Failing)
    }

    pub fn validate_transition(self, to: WorkflowState) -> Result<(), CoreError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(CoreError::IllegalState(format!(
                "Invalid workflow transition: {self} -> {to}"
            )))
        }
    }
}

impl OperationState {
    /// States reachable from `self`.
    pub fn valid_transitions(self) -> &'static [OperationState] {
        use OperationState::*;
        match self {
            Instantiated => &[Running, Skipped, Failed],
            Running => &[Succeeded, Failed, Paused, Skipped],
            Paused => &[Running, Failed],
            Succeeded | Failed | Skipped => &[],
        }
    }

    pub fn can_transition(self, to: OperationState) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// An operation is done once it succeeded, failed or was skipped.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Skipped
        )
    }

    pub fn validate_transition(self, to: OperationState) -> Result<(), CoreError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(CoreError::IllegalState(format!(
                "Invalid operation transition: {self} -> {to}"
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn job_ids_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::from_id(status.id()), Some(*status));
        }
        assert_eq!(JobStatus::from_id(0), None);
        assert_eq!(JobStatus::Running.id(), 2);
    }

    #[test]
    fn labels_parse_case_insensitively() {
        assert_eq!("running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert_eq!(
            "FAILING".parse::<WorkflowState>().unwrap(),
            WorkflowState::Failing
        );
        assert_matches!("done".parse::<OperationState>(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn serde_uses_upper_case_labels() {
        let json = serde_json::to_string(&WorkflowState::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
        let parsed: JobStatus = serde_json::from_str("\"QUEUED\"").unwrap();
        assert_eq!(parsed, JobStatus::Queued);
    }

    // -----------------------------------------------------------------------
    // Job state machine
    // -----------------------------------------------------------------------

    #[test]
    fn job_follows_queued_running_terminal() {
        assert!(JobStatus::Queued.can_transition(JobStatus::Running));
        assert!(JobStatus::Running.can_transition(JobStatus::Finished));
        assert!(JobStatus::Running.can_transition(JobStatus::Failed));
    }

    #[test]
    fn job_cannot_skip_running_to_finished() {
        assert!(!JobStatus::Queued.can_transition(JobStatus::Finished));
    }

    #[test]
    fn terminal_job_statuses_are_final() {
        for to in JobStatus::ALL {
            assert!(!JobStatus::Finished.can_transition(*to));
            assert!(!JobStatus::Failed.can_transition(*to));
        }
    }

    #[test]
    fn job_validate_transition_err() {
        let err = JobStatus::Finished
            .validate_transition(JobStatus::Running)
            .unwrap_err();
        assert_matches!(err, CoreError::IllegalState(msg) if msg.contains("FINISHED -> RUNNING"));
    }

    // -----------------------------------------------------------------------
    // Workflow state machine
    // -----------------------------------------------------------------------

    #[test]
    fn empty_workflow_may_succeed_immediately() {
        assert!(WorkflowState::Instantiated.can_transition(WorkflowState::Succeeded));
    }

    #[test]
    fn paused_workflow_resumes_or_stops() {
        assert!(WorkflowState::Paused.can_transition(WorkflowState::Running));
        assert!(WorkflowState::Paused.can_transition(WorkflowState::Stopped));
        assert!(!WorkflowState::Paused.can_transition(WorkflowState::Succeeded));
    }

    #[test]
    fn failing_leads_to_failed() {
        assert!(WorkflowState::Running.can_transition(WorkflowState::Failing));
        assert!(WorkflowState::Failing.can_transition(WorkflowState::Failed));
        assert!(!WorkflowState::Failing.can_transition(WorkflowState::Succeeded));
    }

    #[test]
    fn terminal_workflow_states() {
        let terminal: Vec<_> = WorkflowState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .copied()
            .collect();
        assert_eq!(
            terminal,
            vec![
                WorkflowState::Stopped,
                WorkflowState::Succeeded,
                WorkflowState::Failed
            ]
        );
        for state in terminal {
            assert!(state.valid_transitions().is_empty());
        }
    }

    // -----------------------------------------------------------------------
    // Operation state machine
    // -----------------------------------------------------------------------

    #[test]
    fn paused_operation_resumes_into_running() {
        assert!(OperationState::Running.can_transition(OperationState::Paused));
        assert!(OperationState::Paused.can_transition(OperationState::Running));
    }

    #[test]
    fn skipped_is_terminal() {
        assert!(OperationState::Skipped.is_terminal());
        assert!(!OperationState::Paused.is_terminal());
        assert_matches!(
            OperationState::Skipped.validate_transition(OperationState::Running),
            Err(CoreError::IllegalState(_))
        );
    }
}
