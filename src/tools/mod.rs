pub mod analyze;
pub mod executor;
pub mod memory;
pub mod payload;
pub mod registry;
pub mod search;
pub mod synthesize;

pub use analyze::AnalyzeTool;
pub use executor::ToolExecutor;
pub use memory::{MemoryEntry, MemorySearchTool, MemoryStore, MemoryType};
pub use payload::{SearchPayload, ToolPayload};
pub use registry::{validate_params, ParamType, Params, Tool, ToolParameter, ToolRegistry, ToolResult};
pub use search::PlatformSearchTool;
pub use synthesize::SynthesizeTool;
