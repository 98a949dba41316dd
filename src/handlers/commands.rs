use crate::{
    auth::Actor,
    commands::{CommandDispatcher, WorkflowCommand},
    ApiResponse, ApiResult, AppState,
};
use axum::{extract::State, response::Json, routing::post, Router};
use serde_json::Value;

pub fn commands_routes() -> Router<AppState> {
    Router::new().route("/commands", post(execute_command))
}

/// Single entry point accepting any tagged workflow command
async fn execute_command(
    State(state): State<AppState>,
    actor: Actor,
    Json(command): Json<WorkflowCommand>,
) -> ApiResult<Value> {
    let dispatcher = CommandDispatcher::new(state.services.clone());
    let result = dispatcher.dispatch(actor, command).await?;
    Ok(Json(ApiResponse::success(result)))
}
