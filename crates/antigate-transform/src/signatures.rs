//! Thought-signature continuity. Chain-of-thought-capable upstream models
//! return an opaque signature per turn that must be echoed back when the
//! turn is replayed as history. Signatures cannot be forged; a miss means
//! the unsigned text is dropped by the adapter.

use std::collections::HashMap;
use std::sync::Mutex;

use antigate_protocol::gemini::Part;

#[derive(Debug, Default)]
pub struct SignatureStore {
    by_tool_call: Mutex<HashMap<String, String>>,
    by_exact_text: Mutex<HashMap<String, String>>,
    by_normalized: Mutex<HashMap<String, (String, String)>>,
}

impl SignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Harvest signatures from a finished response's parts; invoked by the
    /// stream engine on every terminal event list.
    pub fn register_parts(&self, parts: &[Part]) {
        for part in parts {
            let Some(signature) = part.thought_signature.as_deref() else {
                continue;
            };
            if signature.is_empty() {
                continue;
            }
            if let Some(call) = &part.function_call
                && let Some(id) = call.id.as_deref()
            {
                self.by_tool_call
                    .lock()
                    .expect("tool signature map poisoned")
                    .insert(id.to_string(), signature.to_string());
            }
            if let Some(text) = part.text.as_deref()
                && !text.is_empty()
            {
                self.by_exact_text
                    .lock()
                    .expect("text signature map poisoned")
                    .insert(text.to_string(), signature.to_string());
                self.by_normalized
                    .lock()
                    .expect("normalized signature map poisoned")
                    .insert(
                        normalize_text(text),
                        (signature.to_string(), text.to_string()),
                    );
            }
        }
    }

    pub fn for_tool_call(&self, tool_call_id: &str) -> Option<String> {
        self.by_tool_call
            .lock()
            .expect("tool signature map poisoned")
            .get(tool_call_id)
            .cloned()
    }

    /// Exact match first, then trimmed, then normalized.
    pub fn for_text(&self, text: &str) -> Option<String> {
        {
            let exact = self.by_exact_text.lock().expect("text signature map poisoned");
            if let Some(signature) = exact.get(text) {
                return Some(signature.clone());
            }
            if let Some(signature) = exact.get(text.trim()) {
                return Some(signature.clone());
            }
        }
        self.by_normalized
            .lock()
            .expect("normalized signature map poisoned")
            .get(&normalize_text(text))
            .map(|(signature, _)| signature.clone())
    }
}

/// Strip `<think>…</think>` blocks, markdown image references and carriage
/// returns, then trim. Emitted text and replayed history differ in exactly
/// these decorations.
pub(crate) fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("<think>") {
        out.push_str(&rest[..open]);
        match rest[open..].find("</think>") {
            Some(close) => rest = &rest[open + close + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);

    let without_images = strip_markdown_images(&out);
    without_images.replace('\r', "").trim().to_string()
}

fn strip_markdown_images(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("![") {
        let candidate = &rest[start..];
        let stripped = candidate
            .find("](")
            .and_then(|mid| candidate[mid..].find(')').map(|end| mid + end + 1));
        match stripped {
            Some(len) => {
                out.push_str(&rest[..start]);
                rest = &candidate[len..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use antigate_protocol::gemini::FunctionCall;

    fn signed_text_part(text: &str, signature: &str) -> Part {
        Part {
            text: Some(text.to_string()),
            thought_signature: Some(signature.to_string()),
            ..Part::default()
        }
    }

    #[test]
    fn normalization_strips_think_blocks_and_images() {
        let text = "<think>hidden</think>Hello ![alt](http://x/y.png) world\r\n";
        assert_eq!(normalize_text(text), "Hello  world");
    }

    #[test]
    fn lookup_falls_back_exact_trimmed_normalized() {
        let store = SignatureStore::new();
        store.register_parts(&[signed_text_part("answer text", "sig-1")]);

        assert_eq!(store.for_text("answer text").as_deref(), Some("sig-1"));
        assert_eq!(store.for_text("  answer text  ").as_deref(), Some("sig-1"));
        assert_eq!(
            store
                .for_text("<think>x</think>answer text")
                .as_deref(),
            Some("sig-1")
        );
        assert!(store.for_text("different").is_none());
    }

    #[test]
    fn tool_call_signatures_keyed_by_id() {
        let store = SignatureStore::new();
        store.register_parts(&[Part {
            function_call: Some(FunctionCall {
                id: Some("call-1".to_string()),
                name: "lookup".to_string(),
                args: None,
            }),
            thought_signature: Some("sig-t".to_string()),
            ..Part::default()
        }]);
        assert_eq!(store.for_tool_call("call-1").as_deref(), Some("sig-t"));
        assert!(store.for_tool_call("call-2").is_none());
    }
}
