// On-disk naming of downloaded model files.
//
// A (repository, file path) pair is flattened into a single file name that is
// safe on every filesystem we ship to and can be parsed back exactly:
//
//   ("TheBloke/Llama-2-7B-GGUF", "llama-2-7b.Q4_K_M.gguf")
//     -> "TheBloke[-]Llama-2-7B-GGUF[=]llama-2-7b.Q4_K_M.gguf"

const REPO_SEPARATOR: &str = "[-]";
const FILE_SEPARATOR: &str = "[=]";
const PATH_SEPARATOR: &str = "[%]";

/// Suffix of the temp file a download streams into before the final rename.
pub const DOWNLOAD_SUFFIX: &str = ".download";

const RESERVED: [&str; 3] = [REPO_SEPARATOR, FILE_SEPARATOR, PATH_SEPARATOR];

/// Reject keys that would not round-trip or could escape the models directory.
pub fn validate_model_key(model_repo: &str, file_path: &str) -> Result<(), String> {
    let Some((owner, name)) = model_repo.split_once('/') else {
        return Err(format!("modelRepo must look like 'owner/name': {model_repo}"));
    };
    if owner.is_empty() || name.is_empty() || name.contains('/') {
        return Err(format!("modelRepo must look like 'owner/name': {model_repo}"));
    }
    if file_path.is_empty() {
        return Err("filePath must not be empty".to_string());
    }
    if file_path.starts_with('/') || file_path.contains('\\') {
        return Err(format!("filePath must be relative: {file_path}"));
    }
    if file_path.split('/').any(|part| part.is_empty() || part == "..") {
        return Err(format!("filePath contains an invalid segment: {file_path}"));
    }
    for value in [model_repo, file_path] {
        if RESERVED.iter().any(|token| value.contains(token)) {
            return Err(format!("'{value}' contains a reserved sequence"));
        }
        if value.chars().any(|c| c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|')) {
            return Err(format!("'{value}' contains characters not allowed in file names"));
        }
    }
    Ok(())
}

/// Flatten `(model_repo, file_path)` into a single file name.
pub fn format_model_file_name(model_repo: &str, file_path: &str) -> String {
    format!(
        "{}{FILE_SEPARATOR}{}",
        model_repo.replace('/', REPO_SEPARATOR),
        file_path.replace('/', PATH_SEPARATOR)
    )
}

/// Inverse of [`format_model_file_name`]. Returns `None` for foreign files.
pub fn parse_model_file_name(file_name: &str) -> Option<(String, String)> {
    if file_name.ends_with(DOWNLOAD_SUFFIX) {
        return None;
    }
    let (repo, file) = file_name.split_once(FILE_SEPARATOR)?;
    if !repo.contains(REPO_SEPARATOR) || file.is_empty() {
        return None;
    }
    Some((
        repo.replace(REPO_SEPARATOR, "/"),
        file.replace(PATH_SEPARATOR, "/"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let name = format_model_file_name("TheBloke/Llama-2-7B-GGUF", "llama-2-7b.Q4_K_M.gguf");
        assert_eq!(name, "TheBloke[-]Llama-2-7B-GGUF[=]llama-2-7b.Q4_K_M.gguf");
        assert_eq!(
            parse_model_file_name(&name),
            Some((
                "TheBloke/Llama-2-7B-GGUF".to_string(),
                "llama-2-7b.Q4_K_M.gguf".to_string()
            ))
        );
    }

    #[test]
    fn test_nested_file_path() {
        let name = format_model_file_name("org/model", "q4/model.Q4.bin");
        assert!(!name.contains('/'));
        assert_eq!(
            parse_model_file_name(&name),
            Some(("org/model".to_string(), "q4/model.Q4.bin".to_string()))
        );
    }

    #[test]
    fn test_foreign_and_partial_files_are_skipped() {
        assert_eq!(parse_model_file_name("readme.txt"), None);
        assert_eq!(parse_model_file_name("org[-]model[=]a.gguf.download"), None);
    }

    #[test]
    fn test_validate_model_key() {
        assert!(validate_model_key("org/model", "model.Q4.bin").is_ok());
        assert!(validate_model_key("org/model", "sub/model.bin").is_ok());
        assert!(validate_model_key("orgmodel", "model.bin").is_err());
        assert!(validate_model_key("org/model", "../etc/passwd").is_err());
        assert!(validate_model_key("org/model", "/abs.bin").is_err());
        assert!(validate_model_key("org/model", "a[=]b.bin").is_err());
        assert!(validate_model_key("org/model", "").is_err());
    }
}
