//! vigil: queue-driven repository analysis backed by a code knowledge graph
//!
//! The pipeline: an [`AnalysisJob`](models::AnalysisJob) envelope is pulled
//! from the [`queue`], the [`fetch`] layer materializes a working tree, the
//! [`graph`] modules parse it (via [`language`]) into a typed property
//! graph, [`context`] synthesizes the prompt variables from the graph
//! summary, [`llm`] invokes a completion backend with validation and a
//! repair pass, and [`worker`] persists findings through [`persistence`].

pub mod cancel;
pub mod config;
pub mod context;
pub mod fetch;
pub mod graph;
pub mod language;
pub mod llm;
pub mod models;
pub mod persistence;
pub mod prompts;
pub mod queue;
pub mod worker;
