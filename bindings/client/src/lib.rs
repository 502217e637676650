mod api;
mod bus;
mod cli;
mod documents;
mod error;
mod filesystem;
mod http;

pub mod prelude {
    pub use crate::api::{
        CreatePlanResponse, GenerateTasksResponse, KvEntries, KvEntry, LogEntry, MessageResponse,
        PromotePlanResponse, ReviewFinding, Trajectory, TrajectoryEntry,
    };
    pub use crate::bus::{
        follow_message_log, subject_matches, CaptureSubscription, CapturedMessage, InMemoryBus,
        MessageBus,
    };
    pub use crate::cli::{
        CliClient, CliResponse, CliResponseKind, ResponseParser, READY_GRACE, RESPONSE_TIMEOUT,
    };
    pub use crate::documents::{decode, AcceptanceCriterion, PlanDocument, PlanScope, TaskDocument};
    pub use crate::error::{ClientError, DecodeError};
    pub use crate::filesystem::{FilesystemClient, SEMSPEC_DIR};
    pub use crate::http::{HttpClient, WorkflowApi, HTTP_TIMEOUT};
}
