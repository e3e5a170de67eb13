//! # Cliente de Geração — Modelo Generativo Externo
//!
//! Wrapper stateless sobre `models/<m>:generateContent`. Temperatura
//! baixa (0.15), top-p baixo (0.4), top-k pequeno (5) e teto generoso de
//! tokens de saída (8192) — o serviço quer respostas literais ancoradas
//! no contexto, não criatividade.
//!
//! Sem retry nesta camada: erros sobem para o retrieval core, que os
//! expõe ao chamador.
//!
//! O mesmo cliente serve o modo de OCR por visão: cada página vira uma
//! parte `inline_data` com um prompt de transcrição Markdown literal.

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::Config;

const TEMPERATURE: f32 = 0.15;
const TOP_P: f32 = 0.4;
const TOP_K: u32 = 5;
const MAX_OUTPUT_TOKENS: u32 = 8192;

// ─── Formato de requisição/resposta da API ───────────────────────

#[derive(Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inline_data")]
        inline_data: InlineData,
    },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct RequestContent {
    role: String,
    parts: Vec<RequestPart>,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(rename = "topK")]
    top_k: u32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<RequestContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

/// Cliente do modelo generativo.
pub struct GenerationClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl GenerationClient {
    pub fn new(cfg: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: cfg.gemini_api_key.clone(),
            model: cfg.chat_model.clone(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        )
    }

    async fn call(&self, parts: Vec<RequestPart>) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![RequestContent {
                role: "user".into(),
                parts,
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                top_p: TOP_P,
                top_k: TOP_K,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        };

        let resp = self
            .http
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .context("Falha na conexão com o modelo generativo")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("Modelo generativo respondeu {}: {}", status, detail);
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .context("Resposta inválida do modelo generativo")?;

        if let Some(err) = parsed.error {
            anyhow::bail!("Erro do modelo generativo: {}", err.message);
        }

        parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("Modelo generativo não devolveu candidatos"))
    }

    /// Gera texto a partir de um prompt completo já montado.
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        self.call(vec![RequestPart::Text {
            text: prompt.to_string(),
        }])
        .await
    }

    /// Transcreve uma imagem de página (modo de OCR por visão).
    pub async fn generate_vision(
        &self,
        prompt: &str,
        image_bytes: &[u8],
        mime_type: &str,
    ) -> Result<String> {
        let data = base64::engine::general_purpose::STANDARD.encode(image_bytes);
        self.call(vec![
            RequestPart::Text {
                text: prompt.to_string(),
            },
            RequestPart::InlineData {
                inline_data: InlineData {
                    mime_type: mime_type.to_string(),
                    data,
                },
            },
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// O corpo da requisição usa os nomes camelCase do wire format.
    #[test]
    fn test_request_wire_format() {
        let request = GenerateRequest {
            contents: vec![RequestContent {
                role: "user".into(),
                parts: vec![RequestPart::Text { text: "oi".into() }],
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                top_p: TOP_P,
                top_k: TOP_K,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"generationConfig\""));
        assert!(json.contains("\"topP\":0.4"));
        assert!(json.contains("\"maxOutputTokens\":8192"));
    }

    /// Resposta com candidatos concatena as partes de texto.
    #[test]
    fn test_response_parsing() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"Olá"},{"text":" mundo"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let text: String = parsed
            .candidates
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
            .content
            .unwrap()
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect();
        assert_eq!(text, "Olá mundo");
    }
}
