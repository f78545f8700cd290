use async_trait::async_trait;

use crate::{Provider, ProviderRequest, ProviderResult};

/// Local deterministic backend; handy for smoke tests and offline setups.
pub struct EchoProvider {
    name: String,
}

impl EchoProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "echo"
    }

    async fn execute(&self, req: ProviderRequest) -> anyhow::Result<ProviderResult> {
        let mut result = ProviderResult::text(format!("Echo: {}", req.prompt));
        result.session_id = req.session_id;
        result.tokens_in = req.prompt.split_whitespace().count() as u64;
        result.tokens_out = result.tokens_in + 1;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_prompt() {
        let provider = EchoProvider::new("echo");
        let result = provider
            .execute(ProviderRequest {
                prompt: "ping pong".to_string(),
                session_id: "s1".to_string(),
                ..ProviderRequest::default()
            })
            .await
            .expect("result");
        assert_eq!(result.output, "Echo: ping pong");
        assert_eq!(result.session_id, "s1");
        assert_eq!(result.tokens_in, 2);
        assert!(!result.is_error);
    }
}
