//! # Assistant copy
//!
//! Everything the assistant says on its own, without asking the chat backend, lives in
//! an [`AssistantPrompts`] value: the system prompt sent with every request, the identity
//! gate messages, and the apology appended when a turn fails.
//!
//! The copy can be overridden with a YAML file (see `prompts_path` in
//! [`crate::config::CarmatchConfig`]). Missing keys fall back to the built-in Portuguese
//! defaults.
//!
//! ```yaml
//! system_prompt: "Você é a assistente de vendas da loja..."
//! email_request: "Antes de continuar, qual é o seu e-mail?"
//! # email_retry, email_confirmation, apology, inventory_header are optional
//! ```
//!
//! `{name}` in `system_prompt` is replaced with the configured assistant name, and
//! `{email}` in `email_confirmation` with the captured address.

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::Result;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AssistantPrompts {
    /// Instruction sent as the first system message of every chat request.
    pub system_prompt: String,

    /// Reply to the first message of an anonymous session.
    pub email_request: String,

    /// Reply to an identity attempt that is not a valid email.
    pub email_retry: String,

    /// Appended once the email is accepted.
    pub email_confirmation: String,

    /// Appended to the transcript when a chat turn fails.
    pub apology: String,

    /// First line of the inventory block given to the model.
    pub inventory_header: String,
}

impl Default for AssistantPrompts {
    fn default() -> Self {
        Self {
            system_prompt: "Você é {name}, assistente de vendas de um marketplace de veículos. \
                Ajude o cliente a encontrar o veículo ideal, negocie com educação e \
                só recomende veículos que aparecem no estoque informado."
                .to_string(),
            email_request: "Olá! Antes de começarmos, qual é o seu e-mail? \
                Assim consigo te enviar as melhores ofertas."
                .to_string(),
            email_retry: "Hmm, isso não parece um e-mail válido. \
                Pode digitar novamente? (ex: nome@exemplo.com)"
                .to_string(),
            email_confirmation: "Perfeito, anotei {email}! Vamos à sua pergunta.".to_string(),
            apology: "Desculpe, não consegui falar com o assistente agora. \
                Tente novamente em instantes."
                .to_string(),
            inventory_header: "Veículos do estoque relacionados à mensagem do cliente:"
                .to_string(),
        }
    }
}

impl AssistantPrompts {
    pub fn system_prompt_for(&self, assistant_name: &str) -> String {
        self.system_prompt.replace("{name}", assistant_name)
    }

    pub fn confirmation_for(&self, email: &str) -> String {
        self.email_confirmation.replace("{email}", email)
    }
}

/// Load prompts from a YAML file.
///
/// ### Errors
/// Returns an error if the file cannot be read or is not a valid prompts document.
pub fn load_prompts(path: impl AsRef<Path>) -> Result<AssistantPrompts> {
    let path = path.as_ref();
    tracing::info!("Loading prompts: {}", path.display());

    let content = fs::read_to_string(path)?;
    let prompts: AssistantPrompts = serde_yaml::from_str(&content)?;
    Ok(prompts)
}
