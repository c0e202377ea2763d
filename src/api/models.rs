use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 错误码：成功
pub const NO_ERROR: u8 = 0;
/// 错误码：用户已存在
pub const USER_EXISTS: u8 = 1;
/// 错误码：用户不存在
pub const USER_NOT_FOUND: u8 = 2;
/// 错误码：参数错误
pub const PARAMS_ERROR: u8 = 3;

/// 控制接口通用应答
#[derive(Debug, Serialize)]
pub struct CallReply {
    pub code: u8,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl CallReply {
    pub fn ok() -> Self {
        Self {
            code: NO_ERROR,
            reason: String::new(),
        }
    }

    pub fn err(code: u8, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// POST /users 请求体
#[derive(Debug, Deserialize)]
pub struct AddUserRequest {
    pub name: String,
    pub cipher: String,
    pub password: String,
    pub port: u16,
}

/// PATCH /users/{name} 请求体；空字段表示不修改
#[derive(Debug, Default, Deserialize)]
pub struct ModifyRequest {
    #[serde(default)]
    pub cipher: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// POST /filter/sources 请求体
#[derive(Debug, Deserialize)]
pub struct FilterSourcesRequest {
    pub urls: Vec<String>,
}

/// 单个用户的计数
#[derive(Debug, Serialize)]
pub struct UserTraffic {
    pub traffic: u64,
    pub time: i64,
}

/// GET /users 响应：name → 计数
pub type TrafficReply = HashMap<String, UserTraffic>;

/// GET /ciphers 响应
#[derive(Debug, Serialize)]
pub struct CiphersResponse {
    pub ciphers: Vec<&'static str>,
}
