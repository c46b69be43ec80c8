//! Integration tests for snapshot versions through the NoteVault facade

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use notevault::prelude::*;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn create_test_vault() -> (TempDir, NoteVault) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = VersionControlConfig::builder(temp_dir.path())
            .build()
            .expect("Failed to create config");
        let vault = NoteVault::open(config).await.expect("Failed to open vault");
        (temp_dir, vault)
    }

    /// Replace the body of a document, keeping its metadata block
    fn write_body(root: &Path, doc: &str, body: &str) {
        let path = root.join(doc);
        let current = std::fs::read_to_string(&path).unwrap_or_default();
        let header = match current.find("\n---\n") {
            Some(end) if current.starts_with("---\n") => current[..end + 5].to_string(),
            _ => String::new(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create folder");
        }
        std::fs::write(&path, format!("{}{}", header, body)).expect("Failed to write doc");
    }

    async fn save(vault: &NoteVault, doc: &str) -> SaveOutcome {
        vault
            .save_new_version_for_file(doc, SaveOptions::default())
            .await
            .expect("Failed to save version")
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let (temp, vault) = create_test_vault().await;

        write_body(temp.path(), "journal.md", "hello");
        let first = save(&vault, "journal.md").await;
        write_body(temp.path(), "journal.md", "hello world");
        let second = save(&vault, "journal.md").await;
        assert_eq!(first.note_id(), second.note_id());
        let note_id = first.note_id().to_string();

        let deletion = vault
            .delete_version(&note_id, first.version_id())
            .await
            .expect("Failed to delete version");
        assert_eq!(deletion, VersionDeletion::VersionRemoved);

        let history = vault.get_version_history(&note_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, second.version_id());
        assert_eq!(history[0].version_number, 2);

        write_body(temp.path(), "journal.md", "scratch");
        vault
            .restore_version("journal.md", &note_id, second.version_id())
            .await
            .expect("Failed to restore");
        let restored = std::fs::read_to_string(temp.path().join("journal.md")).unwrap();
        assert!(restored.ends_with("hello world"));
        assert!(restored.contains(&note_id));
    }

    #[tokio::test]
    async fn test_duplicate_save_is_idempotent() {
        let (temp, vault) = create_test_vault().await;
        write_body(temp.path(), "a.md", "same text");

        let first = save(&vault, "a.md").await;
        let again = save(&vault, "a.md").await;
        assert!(matches!(first, SaveOutcome::Saved { version_number: 1, .. }));
        assert!(matches!(again, SaveOutcome::Duplicate { .. }));
        assert_eq!(again.version_id(), first.version_id());
        assert_eq!(vault.get_version_history(first.note_id()).await.unwrap().len(), 1);

        let forced = vault
            .save_new_version_for_file(
                "a.md",
                SaveOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(forced, SaveOutcome::Saved { version_number: 2, .. }));
    }

    #[tokio::test]
    async fn test_unicode_form_change_is_a_new_version() {
        let (temp, vault) = create_test_vault().await;
        write_body(temp.path(), "menu.md", "caf\u{00E9}\n");
        let first = save(&vault, "menu.md").await;

        write_body(temp.path(), "menu.md", "cafe\u{0301}\n");
        let second = save(&vault, "menu.md").await;
        assert!(matches!(second, SaveOutcome::Saved { version_number: 2, .. }));
        assert_ne!(second.version_id(), first.version_id());

        let live = std::fs::read_to_string(temp.path().join("menu.md")).unwrap();
        let stored = vault
            .get_version_content(second.note_id(), second.version_id())
            .await
            .unwrap();
        assert_eq!(stored, live);
    }

    #[tokio::test]
    async fn test_foreign_note_id_does_not_split_history() {
        let (temp, vault) = create_test_vault().await;
        write_body(temp.path(), "a.md", "v1");
        let first = save(&vault, "a.md").await;

        // Front matter from elsewhere names a note that was never registered
        std::fs::write(temp.path().join("a.md"), "---\nvc-id: ghost-1\n---\nv2").unwrap();
        let second = save(&vault, "a.md").await;
        write_body(temp.path(), "a.md", "v3");
        let third = save(&vault, "a.md").await;

        assert_eq!(second.note_id(), first.note_id());
        assert_eq!(third.note_id(), first.note_id());
        assert!(matches!(third, SaveOutcome::Saved { version_number: 3, .. }));
        for saved in [&first, &second, &third] {
            vault
                .get_version_content(saved.note_id(), saved.version_id())
                .await
                .expect("Every saved version stays readable");
        }
        assert_eq!(vault.registry().all_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_version_numbers_never_reused() {
        let (temp, vault) = create_test_vault().await;
        let mut ids = Vec::new();
        for body in ["one", "two", "three"] {
            write_body(temp.path(), "a.md", body);
            ids.push(save(&vault, "a.md").await);
        }
        let note_id = ids[0].note_id().to_string();

        vault.delete_version(&note_id, ids[2].version_id()).await.unwrap();
        vault.delete_version(&note_id, ids[1].version_id()).await.unwrap();

        write_body(temp.path(), "a.md", "four");
        let next = save(&vault, "a.md").await;
        assert!(matches!(next, SaveOutcome::Saved { version_number: 4, .. }));

        let numbers: Vec<u64> = vault
            .get_version_history(&note_id)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, vec![4, 1]);
    }

    #[tokio::test]
    async fn test_deleting_last_version_removes_note() {
        let (temp, vault) = create_test_vault().await;
        write_body(temp.path(), "a.md", "only");
        let saved = save(&vault, "a.md").await;

        let deletion = vault
            .delete_version(saved.note_id(), saved.version_id())
            .await
            .unwrap();
        assert_eq!(deletion, VersionDeletion::NoteRemoved);
        assert!(vault.registry().entry(saved.note_id()).await.unwrap().is_none());
        assert!(vault.get_version_history(saved.note_id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retention_caps_branch() {
        let (temp, vault) = create_test_vault().await;
        vault
            .update_global_settings(|s| s.max_versions_per_branch = 2)
            .await
            .unwrap();

        let mut last = None;
        for body in ["v1", "v2", "v3"] {
            write_body(temp.path(), "a.md", body);
            last = Some(save(&vault, "a.md").await);
        }
        let last = last.unwrap();
        let numbers: Vec<u64> = vault
            .get_version_history(last.note_id())
            .await
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_branches() {
        let (temp, vault) = create_test_vault().await;
        write_body(temp.path(), "a.md", "main text");
        let base = save(&vault, "a.md").await;
        let note_id = base.note_id().to_string();

        let seeded = vault
            .create_branch(&note_id, "draft", None)
            .await
            .unwrap()
            .expect("Branch should be seeded");
        let latest = vault.switch_branch(&note_id, "draft").await.unwrap();
        assert_eq!(latest.as_deref(), Some(seeded.as_str()));

        write_body(temp.path(), "a.md", "draft text");
        let on_draft = save(&vault, "a.md").await;
        assert!(matches!(on_draft, SaveOutcome::Saved { version_number: 2, .. }));
        let history = vault.get_version_history(&note_id).await.unwrap();
        assert!(history.iter().all(|v| v.branch == "draft"));
        assert_eq!(history.len(), 2);

        vault.switch_branch(&note_id, DEFAULT_BRANCH).await.unwrap();
        let deletion = vault.delete_branch(&note_id, "draft").await.unwrap();
        assert_eq!(
            deletion,
            VersionDeletion::BranchRemoved {
                branch: "draft".into()
            }
        );
        let branches = vault.list_branches(&note_id).await.unwrap();
        assert_eq!(branches.len(), 1);
        assert!(branches[0].is_current);
    }

    #[tokio::test]
    async fn test_deviation_and_export() {
        let (temp, vault) = create_test_vault().await;
        write_body(temp.path(), "a.md", "# Plan\n");
        let saved = save(&vault, "a.md").await;
        let note_id = saved.note_id().to_string();
        vault
            .update_version_details(&note_id, saved.version_id(), Some("kickoff".into()), None)
            .await
            .unwrap();

        let fork = vault
            .create_deviation(&note_id, saved.version_id(), "forks", "Plan B")
            .await
            .unwrap();
        assert_eq!(fork, "forks/Plan B.md");
        let fork_content = std::fs::read_to_string(temp.path().join(&fork)).unwrap();
        assert_eq!(fork_content, "# Plan\n");
        let second = vault
            .create_deviation(&note_id, saved.version_id(), "forks", "Plan B")
            .await
            .unwrap();
        assert_eq!(second, "forks/Plan B 1.md");

        let json = vault
            .export_version(&note_id, saved.version_id(), ExportFormat::Json)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["versionNumber"], 1);
        assert_eq!(value["name"], "kickoff");
        assert!(value["content"].as_str().unwrap().ends_with("# Plan\n"));

        let txt = vault
            .export_version(&note_id, saved.version_id(), "txt".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(txt, "# Plan\n");
    }

    #[tokio::test]
    async fn test_compare_versions() {
        let (temp, vault) = create_test_vault().await;
        write_body(temp.path(), "a.md", "one\ntwo\n");
        let a = save(&vault, "a.md").await;
        write_body(temp.path(), "a.md", "one\n2\nthree\n");
        let b = save(&vault, "a.md").await;

        let changes = vault
            .compare_versions(a.note_id(), a.version_id(), b.version_id())
            .await
            .unwrap();
        let stats = DiffStats::of(&changes);
        assert_eq!(stats.additions, 2);
        assert_eq!(stats.deletions, 1);

        let events = vault
            .get_or_generate_timeline(a.note_id(), None, HistorySource::Version)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].to_version_id, b.version_id());
        assert_eq!(events[0].stats, stats);
    }

    #[tokio::test]
    async fn test_concurrent_forced_saves_get_distinct_numbers() {
        let (temp, vault) = create_test_vault().await;
        write_body(temp.path(), "a.md", "body");
        let vault = Arc::new(vault);

        let saves = (0..5).map(|_| {
            let vault = vault.clone();
            async move {
                vault
                    .save_new_version_for_file(
                        "a.md",
                        SaveOptions {
                            force: true,
                            ..Default::default()
                        },
                    )
                    .await
            }
        });
        let outcomes: Vec<SaveOutcome> = join_all(saves)
            .await
            .into_iter()
            .collect::<Result<_>>()
            .expect("Concurrent saves failed");

        let note_id = outcomes[0].note_id().to_string();
        assert!(outcomes.iter().all(|o| o.note_id() == note_id));
        let mut numbers: Vec<u64> = vault
            .get_version_history(&note_id)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(vault.registry().all_entries().await.unwrap().len(), 1);
    }
}
