// Context window selection for a model launch.

use gguf_llms::{GgufHeader, GgufReader, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Used when neither the request, the config nor the model file say otherwise.
pub const FALLBACK_CONTEXT_SIZE: u32 = 4096;

/// Read `<arch>.context_length` from a GGUF header.
pub fn read_model_context_length(model_path: &Path) -> Option<u32> {
    let file = File::open(model_path).ok()?;
    let mut reader = BufReader::new(file);
    let header = GgufHeader::parse(&mut reader).ok()?;
    let metadata = GgufReader::read_metadata(&mut reader, header.n_kv).ok()?;

    metadata
        .iter()
        .find(|(key, _)| key.ends_with(".context_length"))
        .and_then(|(_, value)| match value {
            Value::Uint32(n) => Some(*n),
            Value::Uint64(n) => u32::try_from(*n).ok(),
            Value::Int32(n) => u32::try_from(*n).ok(),
            Value::Int64(n) => u32::try_from(*n).ok(),
            _ => None,
        })
        .filter(|n| *n > 0)
}

/// Request value, then configured default, then the model's own length,
/// then [`FALLBACK_CONTEXT_SIZE`]; never above `max`.
pub fn resolve_context_size(
    requested: Option<u32>,
    configured_default: u32,
    max: u32,
    model_path: &Path,
) -> u32 {
    let chosen = requested
        .filter(|n| *n > 0)
        .or_else(|| Some(configured_default).filter(|n| *n > 0))
        .or_else(|| read_model_context_length(model_path))
        .unwrap_or(FALLBACK_CONTEXT_SIZE);

    if max > 0 {
        chosen.min(max)
    } else {
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wins() {
        let missing = Path::new("/nonexistent/model.gguf");
        assert_eq!(resolve_context_size(Some(2048), 8192, 0, missing), 2048);
    }

    #[test]
    fn test_config_default_then_fallback() {
        let missing = Path::new("/nonexistent/model.gguf");
        assert_eq!(resolve_context_size(None, 8192, 0, missing), 8192);
        assert_eq!(resolve_context_size(Some(0), 0, 0, missing), FALLBACK_CONTEXT_SIZE);
    }

    #[test]
    fn test_clamped_to_max() {
        let missing = Path::new("/nonexistent/model.gguf");
        assert_eq!(resolve_context_size(Some(200_000), 0, 131_072, missing), 131_072);
    }

    #[test]
    fn test_unreadable_header_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.gguf");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(read_model_context_length(&path), None);
        assert_eq!(resolve_context_size(None, 0, 0, &path), FALLBACK_CONTEXT_SIZE);
    }
}
