// src/store/journal.rs
// Per-discussion journal: structured JSON (source of truth) plus a rendered
// markdown sibling (spec §4.1, §6). Writes are atomic across both files:
// temp path + fsync + rename, verified present afterward; any mid-write
// error best-effort cleans up its temp path, mirroring the teacher's
// temp-file + rename export (`claude_local/export.rs`) generalized to a pair
// of files that must land together.

use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::model::Discussion;

pub fn user_dir(base: &Path, user_id: &str) -> PathBuf {
    base.join(user_id)
}

pub fn json_path(base: &Path, user_id: &str, id: Uuid) -> PathBuf {
    user_dir(base, user_id).join(format!("{id}.json"))
}

pub fn md_path(base: &Path, user_id: &str, id: Uuid) -> PathBuf {
    user_dir(base, user_id).join(format!("{id}.md"))
}

/// Writes both journal files atomically. On any failure both temp paths are
/// best-effort removed before the error is re-raised.
pub async fn write(base: &Path, discussion: &Discussion) -> AppResult<()> {
    let dir = user_dir(base, &discussion.user_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| AppError::Transient(format!("failed to create discussion dir: {e}")))?;

    let json_final = json_path(base, &discussion.user_id, discussion.id);
    let md_final = md_path(base, &discussion.user_id, discussion.id);
    let json_tmp = json_final.with_extension("json.tmp");
    let md_tmp = md_final.with_extension("md.tmp");

    let json_body = serde_json::to_vec_pretty(discussion)
        .map_err(|e| AppError::Internal(format!("failed to serialize discussion: {e}")))?;
    let md_body = render_markdown(discussion);

    let result = write_atomic_pair(&json_tmp, &json_final, &json_body, &md_tmp, &md_final, md_body.as_bytes()).await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&json_tmp).await;
        let _ = tokio::fs::remove_file(&md_tmp).await;
    }

    result
}

async fn write_atomic_pair(
    json_tmp: &Path,
    json_final: &Path,
    json_body: &[u8],
    md_tmp: &Path,
    md_final: &Path,
    md_body: &[u8],
) -> AppResult<()> {
    write_fsync(json_tmp, json_body).await?;
    write_fsync(md_tmp, md_body).await?;

    tokio::fs::rename(json_tmp, json_final)
        .await
        .map_err(|e| AppError::Transient(format!("failed to rename journal json into place: {e}")))?;
    tokio::fs::rename(md_tmp, md_final)
        .await
        .map_err(|e| AppError::Transient(format!("failed to rename journal md into place: {e}")))?;

    if !json_final.exists() || !md_final.exists() {
        return Err(AppError::Internal(
            "non-atomic filesystem: journal pair did not both land after rename".to_string(),
        ));
    }

    Ok(())
}

async fn write_fsync(path: &Path, body: &[u8]) -> AppResult<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| AppError::Transient(format!("failed to create temp file {}: {e}", path.display())))?;
    file.write_all(body)
        .await
        .map_err(|e| AppError::Transient(format!("failed to write temp file {}: {e}", path.display())))?;
    file.sync_all()
        .await
        .map_err(|e| AppError::Transient(format!("failed to fsync temp file {}: {e}", path.display())))?;
    Ok(())
}

pub async fn read(base: &Path, user_id: &str, id: Uuid) -> AppResult<Discussion> {
    let path = json_path(base, user_id, id);
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(format!("discussion {id}"))
        } else {
            AppError::Transient(format!("failed to read journal {}: {e}", path.display()))
        }
    })?;
    serde_json::from_slice(&bytes).map_err(|e| AppError::Internal(format!("corrupt journal {}: {e}", path.display())))
}

pub async fn delete(base: &Path, user_id: &str, id: Uuid) -> AppResult<()> {
    let json = json_path(base, user_id, id);
    let md = md_path(base, user_id, id);
    for path in [json, md] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) | Err(_) if !path.exists() => {}
            Err(e) => return Err(AppError::Transient(format!("failed to delete {}: {e}", path.display()))),
        }
    }
    Ok(())
}

/// Lists discussion ids present on disk for `user_id`, newest-journal-first by
/// file modified time — used by reconciliation sweeps that have no metadata
/// index row to start from.
pub async fn list_ids(base: &Path, user_id: &str) -> AppResult<Vec<Uuid>> {
    let dir = user_dir(base, user_id);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AppError::Transient(format!("failed to list {}: {e}", dir.display()))),
    };

    let mut ids = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AppError::Transient(format!("failed to read dir entry: {e}")))?
    {
        if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                if let Ok(id) = Uuid::parse_str(stem) {
                    ids.push(id);
                }
            }
        }
    }
    Ok(ids)
}

fn render_markdown(discussion: &Discussion) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let _ = writeln!(out, "# {}", discussion.topic);
    let _ = writeln!(out);
    let _ = writeln!(out, "- id: {}", discussion.id);
    let _ = writeln!(out, "- user: {}", discussion.user_id);
    let _ = writeln!(out, "- resolved: {}", discussion.is_resolved);
    let _ = writeln!(out, "- current round: {}", discussion.current_round);
    let _ = writeln!(out);

    for summary in &discussion.summaries {
        let _ = writeln!(
            out,
            "## Summary through round {} (replaces {:?})\n",
            summary.round_number, summary.replaces_rounds
        );
        let _ = writeln!(out, "{}\n", summary.summary);
    }

    for round in &discussion.rounds {
        let _ = writeln!(out, "## Round {}", round.round_number);
        for (label, slot) in [
            ("Analyzer", &round.analyzer_response),
            ("Solver", &round.solver_response),
            ("Moderator", &round.moderator_response),
        ] {
            if let Some(resp) = slot {
                let _ = writeln!(out, "\n### {label} (turn {})\n\n{}", resp.turn, resp.content);
            }
        }
        out.push('\n');
    }

    for qs in &discussion.questions {
        let _ = writeln!(out, "## Questions for round {}", qs.round_number);
        for q in &qs.questions {
            let _ = writeln!(out, "- {} ({})", q.prompt, q.id);
            for opt in &q.options {
                let marker = q.selected.as_ref().is_some_and(|s| s.contains(&opt.id));
                let _ = writeln!(out, "  - [{}] {} ({})", if marker { "x" } else { " " }, opt.text, opt.id);
            }
        }
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Discussion;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let discussion = Discussion::new(Uuid::new_v4(), "u1".into(), "topic".into(), 4000, 0);

        write(dir.path(), &discussion).await.unwrap();
        let reread = read(dir.path(), "u1", discussion.id).await.unwrap();

        assert_eq!(reread.id, discussion.id);
        assert_eq!(reread.topic, discussion.topic);

        assert!(json_path(dir.path(), "u1", discussion.id).exists());
        assert!(md_path(dir.path(), "u1", discussion.id).exists());
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read(dir.path(), "u1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let discussion = Discussion::new(Uuid::new_v4(), "u1".into(), "topic".into(), 4000, 0);
        write(dir.path(), &discussion).await.unwrap();

        delete(dir.path(), "u1", discussion.id).await.unwrap();
        assert!(!json_path(dir.path(), "u1", discussion.id).exists());
        assert!(!md_path(dir.path(), "u1", discussion.id).exists());
    }

    #[tokio::test]
    async fn list_ids_finds_written_discussions() {
        let dir = tempfile::tempdir().unwrap();
        let d1 = Discussion::new(Uuid::new_v4(), "u1".into(), "a".into(), 4000, 0);
        let d2 = Discussion::new(Uuid::new_v4(), "u1".into(), "b".into(), 4000, 0);
        write(dir.path(), &d1).await.unwrap();
        write(dir.path(), &d2).await.unwrap();

        let mut ids = list_ids(dir.path(), "u1").await.unwrap();
        ids.sort();
        let mut expected = vec![d1.id, d2.id];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
