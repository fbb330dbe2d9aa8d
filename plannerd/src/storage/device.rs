use std::path::Path;

use uuid::Uuid;

/// Returns the identifier stored at `path`, generating and persisting a new one on first
/// use. Identifiers are uppercase hex without dashes.
pub async fn load_or_create_device_id(path: &Path) -> std::io::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) if !text.trim().is_empty() => return Ok(text.trim().to_string()),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    let id = new_device_id();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, &id).await?;
    tokio::fs::rename(&tmp, path).await?;
    log::info!("device: generated id {id}");
    Ok(id)
}

pub fn new_device_id() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn device_id_is_generated_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device_id");

        let first = load_or_create_device_id(&path).await.unwrap();
        let second = load_or_create_device_id(&path).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert_eq!(first, first.to_uppercase());
    }
}
