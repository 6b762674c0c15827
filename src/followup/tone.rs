//! Follow-up message copy. AI-generated when a provider is configured,
//! otherwise canned Spanish lines picked by pressure level and attempt.

use crate::providers::{ChatMessage, Provider};
use crate::store::{Business, FollowUpConfig};
use anyhow::Result;

/// Canned lines per (pressure level, attempt). Level 1 is a soft check-in,
/// level 3 leans on urgency.
const CANNED: [[&str; 3]; 3] = [
    [
        "¡Hola! 😊 Solo quería saber si pudiste ver mi mensaje anterior. ¿Tienes alguna duda?",
        "¡Hola de nuevo! ¿Sigues interesado? Quedo atento a cualquier pregunta.",
        "Hola, no quiero molestarte. Si más adelante te animas, aquí estaré. ¡Buen día!",
    ],
    [
        "¡Hola! ¿Pudiste revisar la información que te envié? Me encantaría ayudarte a decidir.",
        "Hola, ¿qué te pareció la propuesta? Puedo resolver cualquier duda que tengas.",
        "Hola, es mi último mensaje por ahora. Si te interesa, escríbeme y retomamos. 😊",
    ],
    [
        "¡Hola! Los cupos se están agotando rápido, ¿te reservo uno antes de que se acaben?",
        "Hola, la promoción está por terminar. ¿Confirmamos tu pedido hoy?",
        "Última oportunidad: hoy cierra la oferta. ¿Aprovechamos antes de que suba el precio?",
    ],
];

/// Canned fallback line for a given config and attempt (1-based).
pub fn canned_message(fu: &FollowUpConfig, attempt: u32) -> &'static str {
    let level = usize::from(fu.pressure_level.clamp(1, 3)) - 1;
    let idx = (attempt.max(1) as usize - 1).min(2);
    CANNED[level][idx]
}

fn pressure_instruction(level: u8) -> &'static str {
    match level {
        1 => "Tono relajado y amistoso, sin presionar.",
        2 => "Tono cercano pero con intención clara de retomar la venta.",
        _ => "Tono de urgencia: menciona escasez o que la oferta es por tiempo limitado.",
    }
}

/// Produce the follow-up text: ask the model when available, canned line
/// otherwise (and on any provider error).
pub async fn follow_up_text(
    provider: Option<&dyn Provider>,
    model: &str,
    temperature: f64,
    business: &Business,
    fu: &FollowUpConfig,
    attempt: u32,
    recent_context: &str,
) -> Result<String> {
    let Some(provider) = provider else {
        return Ok(canned_message(fu, attempt).to_string());
    };

    let system = format!(
        "Eres el asistente de ventas de {}. Escribe UN solo mensaje corto de WhatsApp \
         en español para retomar una conversación que quedó en silencio. Es el intento \
         número {attempt}. {} No saludes como si fuera la primera vez y no uses comillas.",
        business.name,
        pressure_instruction(fu.pressure_level),
    );
    let user = if recent_context.is_empty() {
        "No hay historial reciente disponible.".to_string()
    } else {
        format!("Últimos mensajes de la conversación:\n{recent_context}")
    };

    let messages = [ChatMessage::system(system), ChatMessage::user(user)];
    match provider.chat(&messages, &[], model, temperature).await {
        Ok(response) => {
            let text = response.text_or_empty().trim().to_string();
            if text.is_empty() {
                Ok(canned_message(fu, attempt).to_string())
            } else {
                Ok(text)
            }
        }
        Err(error) => {
            tracing::warn!("Follow-up generation failed, using canned text: {error:#}");
            Ok(canned_message(fu, attempt).to_string())
        }
    }
}
