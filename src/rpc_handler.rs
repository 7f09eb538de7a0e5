use anyhow::Result;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::services::Backend;
use crate::use_cases::QuizUseCase;

#[derive(Debug, serde::Deserialize)]
struct JsonRpcRequest {
    method: String,
    params: Option<Value>,
    id: Option<Value>,
}

#[derive(Debug, serde::Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id: Some(id.unwrap_or(json!(1))),
        }
    }

    fn failure(id: Option<Value>, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data,
            }),
            id,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Debug, serde::Serialize)]
struct Tool {
    name: String,
    description: String,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
}

pub struct RpcHandler<B: Backend> {
    quiz_use_case: Arc<QuizUseCase<B>>,
}

impl<B: Backend> RpcHandler<B> {
    pub fn new(quiz_use_case: Arc<QuizUseCase<B>>) -> Self {
        Self { quiz_use_case }
    }

    /// Answers newline-delimited requests until the reader is exhausted.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let request = match serde_json::from_str::<JsonRpcRequest>(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Failed to parse request: {} - Line: {}", e, line);
                    let response = JsonRpcResponse::failure(
                        None,
                        -32700,
                        "Parse error".to_string(),
                        Some(json!(e.to_string())),
                    );
                    write_line(&mut writer, &response).await?;
                    continue;
                }
            };

            // Notifications never get a response.
            if request.id.is_none() || request.method.starts_with("notifications/") {
                if request.method == "notifications/initialized" {
                    info!("admin client initialized");
                }
                continue;
            }

            let response = self.handle_request(request).await;
            write_line(&mut writer, &response).await?;
        }

        Ok(())
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => self.handle_initialize(request.id),
            "tools/list" => JsonRpcResponse::success(request.id, json!({ "tools": get_tools() })),
            "tools/call" => self.handle_call_tool(request.params, request.id).await,
            _ => JsonRpcResponse::failure(
                Some(request.id.unwrap_or(json!(1))),
                -32601,
                format!("Method not found: {}", request.method),
                None,
            ),
        }
    }

    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("initializing quiz lottery admin server");
        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": "quiz-lottery",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )
    }

    async fn handle_call_tool(&self, params: Option<Value>, id: Option<Value>) -> JsonRpcResponse {
        let Some(params) = params else {
            return JsonRpcResponse::failure(
                Some(id.unwrap_or(json!(1))),
                -32602,
                "Missing params".to_string(),
                None,
            );
        };
        let Some(tool_name) = params.get("name").and_then(|n| n.as_str()) else {
            return JsonRpcResponse::failure(
                Some(id.unwrap_or(json!(1))),
                -32602,
                "Missing tool name".to_string(),
                None,
            );
        };

        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        let arguments: HashMap<String, Value> = serde_json::from_value(arguments).unwrap_or_default();

        match self.execute_tool(tool_name, &arguments).await {
            Ok(content) => JsonRpcResponse::success(
                id,
                json!({
                    "content": [
                        {
                            "type": "text",
                            "text": content
                        }
                    ]
                }),
            ),
            Err(e) => JsonRpcResponse::failure(
                Some(id.unwrap_or(json!(1))),
                -32603,
                format!("Tool execution error: {:#}", e),
                None,
            ),
        }
    }

    async fn execute_tool(&self, tool_name: &str, arguments: &HashMap<String, Value>) -> Result<String> {
        let quiz = &self.quiz_use_case;
        match tool_name {
            "save_lottery" => quiz.save_lottery(arguments).await,
            "delete_lottery" => quiz.delete_lottery(arguments).await,
            "get_lottery" => quiz.get_lottery(arguments).await,
            "save_game" => quiz.save_game(arguments).await,
            "delete_game" => quiz.delete_game(arguments).await,
            "get_game" => quiz.get_game(arguments).await,
            "participate" => quiz.participate(arguments).await,
            "check_game_result" => quiz.check_game_result(arguments).await,
            "check_lottery_result" => quiz.check_lottery_result(arguments).await,
            _ => Err(anyhow::anyhow!("Unknown tool: {}", tool_name)),
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, response: &JsonRpcResponse) -> Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn id_schema(name: &str, description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            name: {
                "type": "string",
                "description": description
            }
        },
        "required": [name]
    })
}

fn user_schema(id_name: &str, id_description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            id_name: {
                "type": "string",
                "description": id_description
            },
            "user_id": {
                "type": "string",
                "description": "Chat user id"
            }
        },
        "required": [id_name, "user_id"]
    })
}

fn get_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "save_lottery".to_string(),
            description: "Create a quiz lottery or update the configuration of an unfinished one".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "lottery_id": { "type": "string" },
                    "winner_num": { "type": "integer", "description": "Cap on rewarded winners" },
                    "reward_type": { "type": "string", "enum": ["arc_token", "dragonball"] },
                    "reward_amount": { "type": "integer" },
                    "total_quiz_num": { "type": "integer", "description": "Planned number of games" },
                    "winner_required_correct_quiz_num": {
                        "type": "integer",
                        "description": "Correct games required to win"
                    }
                },
                "required": [
                    "lottery_id", "winner_num", "reward_type", "reward_amount",
                    "total_quiz_num", "winner_required_correct_quiz_num"
                ]
            }),
        },
        Tool {
            name: "delete_lottery".to_string(),
            description: "Delete an unfinished lottery that has no games".to_string(),
            input_schema: id_schema("lottery_id", "Lottery id"),
        },
        Tool {
            name: "get_lottery".to_string(),
            description: "Get a lottery, live state first, persisted state otherwise".to_string(),
            input_schema: id_schema("lottery_id", "Lottery id"),
        },
        Tool {
            name: "save_game".to_string(),
            description: "Schedule a quiz game, or update one that has not started".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "game_id": { "type": "string", "description": "Omit to create a new game" },
                    "lottery_id": { "type": "string" },
                    "guild_id": { "type": "string" },
                    "channel_id": { "type": "string" },
                    "time_limit_sec": { "type": "integer" },
                    "send_quiz_at": { "type": "integer", "description": "Unix millis" },
                    "question_description": { "type": "string" },
                    "answer_options": {
                        "type": "array",
                        "items": { "type": "string" },
                        "minItems": 2,
                        "maxItems": 9
                    },
                    "correct_answer_option": { "type": "string" }
                },
                "required": [
                    "lottery_id", "guild_id", "channel_id", "time_limit_sec", "send_quiz_at",
                    "question_description", "answer_options", "correct_answer_option"
                ]
            }),
        },
        Tool {
            name: "delete_game".to_string(),
            description: "Delete a game that has not started".to_string(),
            input_schema: id_schema("game_id", "Game id"),
        },
        Tool {
            name: "get_game".to_string(),
            description: "Get a game, live state first, persisted state otherwise".to_string(),
            input_schema: id_schema("game_id", "Game id"),
        },
        Tool {
            name: "participate".to_string(),
            description: "Record a user's answer while the game is open".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "game_id": { "type": "string" },
                    "user_id": { "type": "string" },
                    "option_id": { "type": "string", "description": "1-based answer option" }
                },
                "required": ["game_id", "user_id", "option_id"]
            }),
        },
        Tool {
            name: "check_game_result".to_string(),
            description: "Check one user's result in a game".to_string(),
            input_schema: user_schema("game_id", "Game id"),
        },
        Tool {
            name: "check_lottery_result".to_string(),
            description: "Check whether a user won a lottery".to_string(),
            input_schema: user_schema("lottery_id", "Lottery id"),
        },
    ]
}

pub fn stdio() -> (BufReader<tokio::io::Stdin>, tokio::io::Stdout) {
    (BufReader::new(tokio::io::stdin()), tokio::io::stdout())
}
