//! Chat prompt construction and response parsing
//!
//! Prompts are in Portuguese, matching the descriptions they classify.
//! Parsing is lenient about the envelope (bare array, single object, or an
//! object wrapping an array) and strict about producing exactly one guess
//! per input item.

use serde_json::{json, Map, Value};
use spendcat_common::HierarchyLookup;
use std::collections::BTreeMap;

use super::{LlmContext, LlmGuess, LlmTransportError};
use spendcat_common::CategoryPath;

/// Cap on the serialized taxonomy embedded in the user message
pub const TAXONOMY_HINT_CHARS: usize = 3000;

const EXAMPLE: &str = r#"[{"item": "Caneta", "N1": "Material de Escritório", "N2": "Escrita", "N3": "Canetas", "N4": "Caneta Esferográfica", "confidence": 0.95}]"#;

/// System instruction for one request
pub fn system_message(context: &LlmContext) -> String {
    let client = match context.client_context.as_deref() {
        Some(c) if !c.trim().is_empty() => format!("para o cliente: {}", c.trim()),
        _ => String::new(),
    };

    let mut message = format!(
        "Você é um especialista em classificação de gastos (Spend Analysis) {}. \
         Considere que estamos operando no setor: {}. ",
        client, context.sector
    );

    if context.taxonomy.is_some() {
        message.push_str(
            "Sua tarefa é classificar materiais e serviços utilizando como base a hierarquia customizada fornecida. \
             Tente manter-se fiel às categorias (N1, N2, N3, N4) da hierarquia fornecida. \
             Se um item não se encaixar perfeitamente em nenhuma categoria, escolha a categoria mais genérica ou próxima disponível na hierarquia. \
             IMPORTANTE: Você deve SEMPRE retornar a resposta no formato JSON solicitado, nunca responda com mensagens de erro ou justificativas de que não conseguiu classificar. ",
        );
    } else {
        message.push_str(
            "Sua tarefa é classificar materiais e serviços usando a taxonomia UNSPSC. \
             Considere o contexto do setor para decidir a categoria mais adequada \
             (ex: Ar Condicionado em Escola pode ser Infraestrutura Escolar, em Indústria pode ser Facilities/MRO). ",
        );
    }

    message.push_str(
        "Para cada item, identifique o Segmento (N1), Família (N2), Classe (N3) e Mercadoria (N4). \
         Responda APENAS um array JSON. Exemplo: ",
    );
    message.push_str(EXAMPLE);
    message
}

/// User message listing the items, with an optional taxonomy excerpt
pub fn user_message(items: &[String], taxonomy: Option<&HierarchyLookup>) -> String {
    let hint = taxonomy
        .map(|lookup| {
            format!(
                "\nUse a seguinte hierarquia como base:\n{}",
                truncate_chars(&taxonomy_json(lookup), TAXONOMY_HINT_CHARS)
            )
        })
        .unwrap_or_default();

    let list = items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n");

    format!("Classifique os seguintes itens{}:\n{}", hint, list)
}

/// Chat-completions request body
pub fn request_body(items: &[String], context: &LlmContext) -> Value {
    json!({
        "messages": [
            {"role": "system", "content": system_message(context)},
            {"role": "user", "content": user_message(items, context.taxonomy.as_deref())}
        ],
        "temperature": 0.0,
        "response_format": {"type": "json_object"}
    })
}

/// Taxonomy as nested N1 → N2 → N3 → [N4], keys sorted
fn taxonomy_json(lookup: &HierarchyLookup) -> String {
    let mut tree: BTreeMap<&str, BTreeMap<&str, BTreeMap<&str, Vec<&str>>>> = BTreeMap::new();
    for entry in lookup.entries() {
        tree.entry(entry.n1.as_str())
            .or_default()
            .entry(entry.n2.as_str())
            .or_default()
            .entry(entry.n3.as_str())
            .or_default()
            .push(entry.n4.as_str());
    }
    serde_json::to_string(&tree).unwrap_or_default()
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Message content of a chat-completions response body
pub fn extract_content(body: &Value) -> Result<&str, LlmTransportError> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmTransportError::Malformed("missing choices[0].message.content".into()))
}

/// Map the model's answer back onto `items`
///
/// Always returns `items.len()` guesses. Unusable answers become
/// placeholders.
pub fn parse_guesses(content: &str, items: &[String], default_confidence: f64) -> Vec<LlmGuess> {
    let parsed: Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(_) => return placeholders(items, "Resposta não é JSON"),
    };

    let results: Vec<Map<String, Value>> = match parsed {
        Value::Object(obj) if obj.contains_key("error") => {
            let reason = format!("API Error: {}", display_value(&obj["error"]));
            return placeholders(items, &reason);
        }
        Value::Object(obj) if obj.contains_key("N1") || obj.contains_key("N2") => vec![obj],
        Value::Object(obj) => match obj.into_iter().find_map(|(_, v)| match v {
            Value::Array(list) => Some(list),
            _ => None,
        }) {
            Some(list) => objects(list),
            None => return placeholders(items, "Formato inesperado"),
        },
        Value::Array(list) => objects(list),
        _ => return placeholders(items, "Formato inesperado"),
    };

    let mut used = vec![false; results.len()];
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let chosen = pick_result(idx, item, &results, &used);
            match chosen {
                Some(pos) if has_category(&results[pos]) => {
                    used[pos] = true;
                    guess_from(&results[pos], default_confidence)
                }
                Some(pos) => {
                    used[pos] = true;
                    LlmGuess::placeholder("Item não retornado pelo LLM")
                }
                None => LlmGuess::placeholder("Item não retornado pelo LLM"),
            }
        })
        .collect()
}

/// Position order: same index, then item text, then first unused
fn pick_result(idx: usize, item: &str, results: &[Map<String, Value>], used: &[bool]) -> Option<usize> {
    if idx < results.len() && !used[idx] && has_category(&results[idx]) {
        return Some(idx);
    }
    let by_text = results.iter().enumerate().position(|(pos, r)| {
        !used[pos]
            && r.get("item")
                .map(|v| {
                    let text = display_value(v);
                    text == item || text.contains(item)
                })
                .unwrap_or(false)
    });
    by_text.or_else(|| used.iter().position(|u| !u))
}

fn has_category(result: &Map<String, Value>) -> bool {
    !field(result, "N1").is_empty() || !field(result, "N2").is_empty()
}

fn guess_from(result: &Map<String, Value>, default_confidence: f64) -> LlmGuess {
    let confidence = match result.get("confidence") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|c| c.is_finite())
    .unwrap_or(default_confidence)
    .clamp(0.0, 1.0);

    LlmGuess {
        path: CategoryPath::new(
            field(result, "N1"),
            field(result, "N2"),
            field(result, "N3"),
            field(result, "N4"),
        ),
        confidence,
        explanation: "Classificado via Azure OpenAI".to_string(),
    }
}

fn field(result: &Map<String, Value>, key: &str) -> String {
    result
        .get(key)
        .map(display_value)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn display_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn objects(list: Vec<Value>) -> Vec<Map<String, Value>> {
    list.into_iter()
        .filter_map(|v| match v {
            Value::Object(obj) => Some(obj),
            _ => None,
        })
        .collect()
}

/// One placeholder per item
pub fn placeholders(items: &[String], reason: &str) -> Vec<LlmGuess> {
    items.iter().map(|_| LlmGuess::placeholder(reason)).collect()
}
