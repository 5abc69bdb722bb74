pub mod config;
pub mod driver;
pub mod error;
pub mod grouping;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod proposal;
pub mod review;
pub mod storage;

pub use config::SiteMergeConfig;
pub use driver::{DedupeOptions, Driver, KindSummary, RunSummary};
pub use error::{ExitCode, Result, SiteMergeError};
pub use merge::{MergeExecutor, MergeReport, MergeStatus};
pub use models::{
    ArchivedRecord, Company, DuplicateGroup, Entity, EntityId, EntityKind, Facility, GroupStrategy, MergeProposal, Row,
};
pub use proposal::{Mergeable, ProposalBuilder};
pub use review::{AlwaysAccept, AutoOnly, Decision, GroupReview, Reviewer, ScriptedReviewer};
