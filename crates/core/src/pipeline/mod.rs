//! The execution pipeline: transport primitive, rename machinery, and the
//! fetch-to-commit stages of the out-of-order core.

/// Two-row tickable pipeline buffer.
pub mod buffer;
/// Decode unit.
pub mod decode;
/// Dispatch/issue unit.
pub mod dispatch;
/// Execution units.
pub mod execute;
/// Fetch unit with loop buffer.
pub mod fetch;
/// Load/store queue.
pub mod lsq;
/// Issue port allocation.
pub mod ports;
/// Register alias table.
pub mod rat;
/// Rename unit.
pub mod rename;
/// Reorder buffer.
pub mod rob;
/// Writeback unit.
pub mod writeback;

pub use buffer::PipelineBuffer;
pub use decode::DecodeUnit;
pub use dispatch::DispatchIssueUnit;
pub use execute::ExecutionUnit;
pub use fetch::FetchUnit;
pub use lsq::{CompletionOrder, LoadStoreQueue};
pub use ports::{BalancedPortAllocator, PortAllocator};
pub use rat::RegisterAliasTable;
pub use rename::RenameUnit;
pub use rob::ReorderBuffer;
pub use writeback::WritebackUnit;
