//! Runtime lifecycle events.
//!
//! The event bus delivers envelopes with a topic and an opaque protobuf
//! payload. Envelopes are decoded exactly once into [`LifecycleEvent`];
//! topics the watcher does not care about decode to `None`.

use prost::Message;

use crate::error::DiscoveryError;

/// Topic published when a task starts.
pub const TASK_START_TOPIC: &str = "/tasks/start";
/// Topic published when a task's primary process exits.
pub const TASK_EXIT_TOPIC: &str = "/tasks/exit";
/// Topic published when a task is deleted.
pub const TASK_DELETE_TOPIC: &str = "/tasks/delete";

/// Event bus envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Runtime namespace the event belongs to.
    pub namespace: String,
    /// Event topic, e.g. `/tasks/start`.
    pub topic: String,
    /// Type URL of the payload.
    pub type_url: String,
    /// Encoded payload.
    pub payload: Vec<u8>,
}

/// Topic classes the watcher dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Task started.
    Start,
    /// Task exited.
    Exit,
    /// Task deleted.
    Delete,
}

impl Topic {
    /// Classify a topic string.
    pub fn from_topic(topic: &str) -> Option<Self> {
        match topic {
            TASK_START_TOPIC => Some(Topic::Start),
            TASK_EXIT_TOPIC => Some(Topic::Exit),
            TASK_DELETE_TOPIC => Some(Topic::Delete),
            _ => None,
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Start => "start",
            Topic::Exit => "exit",
            Topic::Delete => "delete",
        }
    }
}

/// A decoded lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// A container's task started.
    Start {
        /// Container id.
        container_id: String,
        /// Pid of the primary process.
        pid: u32,
    },
    /// A process in the container exited.
    Exit {
        /// Container id.
        container_id: String,
        /// Exec id, equal to the container id for the primary process.
        exec_id: String,
        /// Pid of the exited process.
        pid: u32,
        /// Exit status.
        exit_status: u32,
    },
    /// A container's task was deleted.
    Delete {
        /// Container id.
        container_id: String,
        /// Pid of the primary process.
        pid: u32,
        /// Exit status.
        exit_status: u32,
    },
}

impl LifecycleEvent {
    /// Decode an envelope. Returns `Ok(None)` for topics that are not
    /// lifecycle events.
    pub fn decode(envelope: &Envelope) -> Result<Option<Self>, DiscoveryError> {
        let Some(topic) = Topic::from_topic(&envelope.topic) else {
            return Ok(None);
        };
        let payload = envelope.payload.as_slice();
        let decode_err = |e: prost::DecodeError| DiscoveryError::Decode {
            topic: envelope.topic.clone(),
            reason: e.to_string(),
        };

        let event = match topic {
            Topic::Start => {
                let start = TaskStart::decode(payload).map_err(decode_err)?;
                LifecycleEvent::Start {
                    container_id: start.container_id,
                    pid: start.pid,
                }
            }
            Topic::Exit => {
                let exit = TaskExit::decode(payload).map_err(decode_err)?;
                LifecycleEvent::Exit {
                    container_id: exit.container_id,
                    exec_id: exit.id,
                    pid: exit.pid,
                    exit_status: exit.exit_status,
                }
            }
            Topic::Delete => {
                let delete = TaskDelete::decode(payload).map_err(decode_err)?;
                LifecycleEvent::Delete {
                    container_id: delete.container_id,
                    pid: delete.pid,
                    exit_status: delete.exit_status,
                }
            }
        };

        if event.container_id().is_empty() {
            return Err(DiscoveryError::Decode {
                topic: envelope.topic.clone(),
                reason: "missing container id".to_string(),
            });
        }
        Ok(Some(event))
    }

    /// A synthetic start event for a container found at startup.
    pub fn synthetic_start(container_id: impl Into<String>) -> Self {
        LifecycleEvent::Start {
            container_id: container_id.into(),
            pid: 0,
        }
    }

    /// A synthetic delete for a container that went away while no event
    /// stream was open.
    pub fn synthetic_delete(container_id: impl Into<String>) -> Self {
        LifecycleEvent::Delete {
            container_id: container_id.into(),
            pid: 0,
            exit_status: 0,
        }
    }

    /// Container the event refers to.
    pub fn container_id(&self) -> &str {
        match self {
            LifecycleEvent::Start { container_id, .. }
            | LifecycleEvent::Exit { container_id, .. }
            | LifecycleEvent::Delete { container_id, .. } => container_id,
        }
    }

    /// Topic class of the event.
    pub fn topic(&self) -> Topic {
        match self {
            LifecycleEvent::Start { .. } => Topic::Start,
            LifecycleEvent::Exit { .. } => Topic::Exit,
            LifecycleEvent::Delete { .. } => Topic::Delete,
        }
    }

    /// Whether an exit event is for the container's primary process rather
    /// than an exec'd process.
    pub fn is_primary_exit(&self) -> bool {
        match self {
            LifecycleEvent::Exit {
                container_id,
                exec_id,
                ..
            } => exec_id.is_empty() || exec_id == container_id,
            _ => true,
        }
    }
}

/// `containerd.events.TaskStart`
#[derive(Clone, PartialEq, Message)]
pub struct TaskStart {
    /// Container id.
    #[prost(string, tag = "1")]
    pub container_id: String,
    /// Pid of the primary process.
    #[prost(uint32, tag = "2")]
    pub pid: u32,
}

/// `containerd.events.TaskExit`
#[derive(Clone, PartialEq, Message)]
pub struct TaskExit {
    /// Container id.
    #[prost(string, tag = "1")]
    pub container_id: String,
    /// Exec id.
    #[prost(string, tag = "2")]
    pub id: String,
    /// Pid of the process.
    #[prost(uint32, tag = "3")]
    pub pid: u32,
    /// Exit status.
    #[prost(uint32, tag = "4")]
    pub exit_status: u32,
}

/// `containerd.events.TaskDelete`
#[derive(Clone, PartialEq, Message)]
pub struct TaskDelete {
    /// Container id.
    #[prost(string, tag = "1")]
    pub container_id: String,
    /// Pid of the primary process.
    #[prost(uint32, tag = "2")]
    pub pid: u32,
    /// Exit status.
    #[prost(uint32, tag = "3")]
    pub exit_status: u32,
    /// Exec id.
    #[prost(string, tag = "5")]
    pub id: String,
}
