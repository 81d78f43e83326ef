use super::*;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, contents: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    std::fs::write(path, contents).expect("Failed to write file");
}

#[tokio::test]
async fn test_fs_list_is_sorted_and_recursive() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    write(dir.path(), "b.txt", "b");
    write(dir.path(), "a.md", "a");
    write(dir.path(), "nested/c.pdf", "c");

    let source = FsBlobSource::new(dir.path());
    let names = source.list("").await.expect("list succeeds");

    assert_eq!(names, vec!["a.md", "b.txt", "nested/c.pdf"]);
}

#[tokio::test]
async fn test_fs_list_filters_by_prefix() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    write(dir.path(), "rental.txt", "r");
    write(dir.path(), "repair.txt", "r");
    write(dir.path(), "fees.txt", "f");

    let source = FsBlobSource::new(dir.path());
    let names = source.list("re").await.expect("list succeeds");

    assert_eq!(names, vec!["rental.txt", "repair.txt"]);
}

#[tokio::test]
async fn test_fs_missing_root_lists_nothing() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let source = FsBlobSource::new(dir.path().join("missing"));

    assert!(source.list("").await.expect("list succeeds").is_empty());
}

#[tokio::test]
async fn test_fs_read_rejects_escaping_names() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let source = FsBlobSource::new(dir.path());

    assert!(source.read("../secret.txt").await.is_err());
}

#[tokio::test]
async fn test_fs_read_nested() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    write(dir.path(), "nested/c.txt", "contents");

    let source = FsBlobSource::new(dir.path());
    let bytes = source.read("nested/c.txt").await.expect("read succeeds");

    assert_eq!(bytes, b"contents");
}

#[tokio::test]
async fn test_memory_source() {
    let source = MemoryBlobSource::new()
        .with_document("a.txt", "alpha")
        .with_document("b.txt", "beta");

    assert_eq!(source.list("").await.expect("list"), vec!["a.txt", "b.txt"]);
    assert_eq!(source.read("b.txt").await.expect("read"), b"beta");
    assert!(source.read("c.txt").await.is_err());
}

#[tokio::test]
async fn test_chained_source_last_write_wins() {
    let local = MemoryBlobSource::new()
        .with_document("rules.txt", "local copy")
        .with_document("local-only.txt", "local");
    let remote = MemoryBlobSource::new().with_document("rules.txt", "remote copy");

    let chained = ChainedBlobSource::new(vec![Arc::new(local), Arc::new(remote)]);

    let names = chained.list("").await.expect("list succeeds");
    assert_eq!(names, vec!["local-only.txt", "rules.txt", "rules.txt"]);

    assert_eq!(
        chained.read("rules.txt").await.expect("read"),
        b"remote copy"
    );
    assert_eq!(
        chained.read("local-only.txt").await.expect("read"),
        b"local"
    );
    assert!(chained.read("missing.txt").await.is_err());
}

#[tokio::test]
async fn test_empty_chain() {
    let chained = ChainedBlobSource::default();
    assert!(chained.is_empty());
    assert!(chained.list("").await.expect("list").is_empty());
    assert!(chained.read("x").await.is_err());
}
