//! 派发前的输入/输出校验
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{ProfilerError, Result};

/// 写权限探测文件名（探测后立即删除）
const WRITE_PROBE: &str = ".autoprofile-write-probe";

/// 校验输入文件：存在、是普通文件、可读、非空、不超过大小上限；返回文件大小
pub fn validate_input(path: &Path, max_size_bytes: u64) -> Result<u64> {
    let input_err = |reason: String| ProfilerError::Input { path: path.to_path_buf(), reason };

    let md = std::fs::metadata(path).map_err(|e| input_err(format!("cannot access file: {e}")))?;
    if !md.is_file() {
        return Err(input_err("not a regular file".to_string()));
    }
    File::open(path).map_err(|e| input_err(format!("file is not readable: {e}")))?;
    let size = md.len();
    if size == 0 {
        return Err(ProfilerError::EmptyInput(path.to_path_buf()));
    }
    if size > max_size_bytes {
        return Err(input_err(format!("file size {size} bytes exceeds maximum of {max_size_bytes} bytes")));
    }
    Ok(size)
}

/// 默认输出根目录：`<输入所在目录>/<输入文件名去扩展名>/`
pub fn default_output_root(input: &Path) -> Result<PathBuf> {
    let stem = input.file_stem().ok_or_else(|| ProfilerError::Input {
        path: input.to_path_buf(),
        reason: "cannot derive an output directory name".to_string(),
    })?;
    let parent = input.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    Ok(parent.join(stem))
}

/// 确定并创建输出根目录，确认可写
pub fn prepare_output_root(input: &Path, requested: Option<&Path>) -> Result<PathBuf> {
    let root = match requested {
        Some(p) => p.to_path_buf(),
        None => default_output_root(input)?,
    };
    let output_err = |reason: String| ProfilerError::Output { path: root.clone(), reason };

    std::fs::create_dir_all(&root).map_err(|e| output_err(format!("cannot create directory: {e}")))?;
    let probe = root.join(WRITE_PROBE);
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
        .map_err(|e| output_err(format!("directory is not writable: {e}")))?;
    let _ = std::fs::remove_file(&probe);
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_regular_non_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("data.csv");
        std::fs::write(&p, "a,b\n1,2\n").unwrap();
        assert_eq!(validate_input(&p, 1024).unwrap(), 8);
    }

    #[test]
    fn rejects_missing_directory_empty_and_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.csv");
        assert!(matches!(validate_input(&missing, 1024), Err(ProfilerError::Input { .. })));
        assert!(matches!(validate_input(dir.path(), 1024), Err(ProfilerError::Input { ref reason, .. }) if reason.contains("regular file")));

        let empty = dir.path().join("empty.csv");
        std::fs::write(&empty, "").unwrap();
        assert!(matches!(validate_input(&empty, 1024), Err(ProfilerError::EmptyInput(_))));

        let big = dir.path().join("big.csv");
        std::fs::write(&big, "x".repeat(100)).unwrap();
        let err = validate_input(&big, 10).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"), "{err}");
        assert!(err.aborts_run());
    }

    #[test]
    fn default_output_root_is_next_to_input() {
        assert_eq!(
            default_output_root(Path::new("/data/sales.csv")).unwrap(),
            PathBuf::from("/data/sales")
        );
        assert_eq!(default_output_root(Path::new("sales.tsv")).unwrap(), PathBuf::from("./sales"));
    }

    #[test]
    fn output_root_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("orders.csv");
        std::fs::write(&input, "a\n1\n").unwrap();

        let root = prepare_output_root(&input, None).unwrap();
        assert_eq!(root, dir.path().join("orders"));
        assert!(root.is_dir());
        assert!(!root.join(WRITE_PROBE).exists());

        let explicit = dir.path().join("reports/nested");
        assert_eq!(prepare_output_root(&input, Some(&explicit)).unwrap(), explicit);
        assert!(explicit.is_dir());
    }

    #[test]
    fn output_root_that_is_a_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("orders.csv");
        std::fs::write(&input, "a\n1\n").unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        assert!(matches!(prepare_output_root(&input, Some(&blocker)), Err(ProfilerError::Output { .. })));
    }
}
