use std::borrow::Cow;

/// Pluralize (add an 's' sufix) to `text` based on `count`.
pub fn pluralize(text: &str, count: usize) -> Cow<'_, str> {
    if count == 1 {
        text.into()
    } else {
        format!("{}s", text).into()
    }
}

/// Keeps at most `max` characters of `text`.
pub fn truncate_chars(text: &str, max: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].into(),
        None => text.into(),
    }
}

/// Deserializes a JSON request body, reporting the path of the offending
/// field on failure.
pub fn deserialize_payload<T: serde::de::DeserializeOwned>(v: &[u8]) -> anyhow::Result<T> {
    let mut deserializer = serde_json::Deserializer::from_slice(v);
    let res: Result<T, _> = serde_path_to_error::deserialize(&mut deserializer);
    match res {
        Ok(r) => Ok(r),
        Err(e) => {
            let path = e.path().to_string();
            Err(anyhow::Error::new(e.into_inner()).context(format!("invalid payload at `{path}`")))
        }
    }
}
