//! Runtime core of the Humo companion robot.
//!
//! A single long-running process supervising vision capture and detection,
//! a face-driven social state machine, head/body tracking, a wake-word
//! voice conversation loop backed by a local llama-server child process,
//! and a WebSocket command surface. The [`runtime::Runtime`] owns all of
//! it: services are built from a JSON config, started in dependency order
//! and stopped in reverse with bounded timeouts.

pub mod audio;
pub mod behavior;
pub mod bus;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod conversation_service;
pub mod detect;
pub mod led;
pub mod llama;
pub mod llm;
pub mod movement;
pub mod pid;
pub mod runtime;
pub mod social;
pub mod tracker;
pub mod vision;
pub mod ws;

pub use behavior::{BehaviorCoordinator, BehaviorMode};
pub use bus::{Bus, BusReceiver};
pub use config::AppConfig;
pub use conversation::{ConversationFsm, ConversationPhase, ConversationTuning};
pub use conversation_service::{ConversationService, ConversationServiceConfig};
pub use detect::{Detection, Roi, TargetBox};
pub use led::{LedService, LedState};
pub use llama::{LlamaServer, LlamaServerConfig, LlamaServerError};
pub use llm::{ChatMessage, LlamaHttpClient, LlmClient};
pub use movement::{HeadLimits, Movement};
pub use runtime::{Platform, Runtime, Services};
pub use social::{SocialFsm, SocialState};
pub use tracker::VisualTracker;
pub use vision::{Camera, Frame, Pipeline, VisionLoop};
