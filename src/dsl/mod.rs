//! Plan DSL: schema, expressions, parser, and static validation.

pub mod expr;
pub mod parser;
pub mod schema;
pub mod validation;

pub use expr::{EvalContext, ExprError, ExprRef, WhenExpr};
pub use parser::parse_plan;
pub use schema::{
    Action, AutoAction, ExecutionConfig, Plan, RetryConfig, Role, SignatureBlock, Step,
    StepStatus, WebEngineKind, CURRENT_DSL_VERSION, SUPPORTED_DSL_VERSIONS,
};
pub use validation::{validate_plan, Diagnostic, DiagnosticLevel, ValidationReport};
