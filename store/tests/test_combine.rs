mod common;

use anyhow::Result;
use common::*;
use store::{CoverageData, CoverageError, DataOptions, DataSuffix, PathAliases};

#[tokio::test]
async fn merging_line_stores_unions_per_file() -> Result<()> {
    let mut first = memory_data();
    first.add_lines(&lines_map(&[("f", &[1, 2])])).await?;
    let mut second = memory_data();
    second.add_lines(&lines_map(&[("f", &[2, 3])])).await?;

    first.update(&mut second, None).await?;
    assert_eq!(first.lines("f").await?, Some(vec![1, 2, 3]));
    // The other store is untouched.
    assert_eq!(second.lines("f").await?, Some(vec![2, 3]));
    Ok(())
}

#[tokio::test]
async fn merging_keeps_disjoint_files_apart() -> Result<()> {
    let mut first = memory_data();
    first.add_lines(&lines_map(&[("a.py", &[1])])).await?;
    let mut second = memory_data();
    second.add_lines(&lines_map(&[("b.py", &[9])])).await?;

    first.update(&mut second, None).await?;
    assert_eq!(first.lines("a.py").await?, Some(vec![1]));
    assert_eq!(first.lines("b.py").await?, Some(vec![9]));
    assert_eq!(first.measured_files().len(), 2);
    Ok(())
}

#[tokio::test]
async fn merging_arc_stores_unions_arcs() -> Result<()> {
    let mut first = memory_data();
    first.add_arcs(&arcs_map(&[("f", &[(-1, 1), (1, 2)])])).await?;
    let mut second = memory_data();
    second.add_arcs(&arcs_map(&[("f", &[(1, 2), (2, -1)])])).await?;

    first.update(&mut second, None).await?;
    assert_eq!(
        first.arcs("f").await?,
        Some(vec![(-1, 1), (1, 2), (2, -1)])
    );
    assert!(first.has_arcs());
    Ok(())
}

#[tokio::test]
async fn merging_mixed_modes_is_an_error() -> Result<()> {
    let mut lines_store = memory_data();
    lines_store.add_lines(&lines_map(&[("f", &[1])])).await?;
    let mut arcs_store = memory_data();
    arcs_store.add_arcs(&arcs_map(&[("f", &[(1, 2)])])).await?;

    let err = lines_store.update(&mut arcs_store, None).await.unwrap_err();
    assert!(matches!(err, CoverageError::Data(ref msg)
        if msg == "Can't combine arc data with line data"));

    let err = arcs_store.update(&mut lines_store, None).await.unwrap_err();
    assert!(matches!(err, CoverageError::Data(ref msg)
        if msg == "Can't combine line data with arc data"));
    Ok(())
}

#[tokio::test]
async fn merging_with_an_empty_store_changes_nothing() -> Result<()> {
    let mut data = memory_data();
    data.add_lines(&lines_map(&[("f", &[1, 2])])).await?;
    let mut empty = memory_data();
    data.update(&mut empty, None).await?;
    assert_eq!(data.lines("f").await?, Some(vec![1, 2]));

    // And merging into an empty store adopts the other's mode and data.
    let mut target = memory_data();
    let mut source = memory_data();
    source.add_arcs(&arcs_map(&[("g", &[(1, -1)])])).await?;
    target.update(&mut source, None).await?;
    assert!(target.has_arcs());
    assert_eq!(target.arcs("g").await?, Some(vec![(1, -1)]));
    Ok(())
}

#[tokio::test]
async fn merging_preserves_contexts() -> Result<()> {
    let mut first = memory_data();
    first.set_context(Some("test_a"));
    first.add_lines(&lines_map(&[("f", &[1])])).await?;
    let mut second = memory_data();
    second.set_context(Some("test_b"));
    second.add_lines(&lines_map(&[("f", &[2])])).await?;

    first.update(&mut second, None).await?;
    assert_eq!(
        first.measured_contexts().await?,
        ["test_a".to_string(), "test_b".to_string()]
            .into_iter()
            .collect()
    );
    first.set_query_context("test_b").await?;
    assert_eq!(first.lines("f").await?, Some(vec![2]));
    first.set_query_contexts(&[]).await?;
    assert_eq!(first.lines("f").await?, Some(vec![1, 2]));
    Ok(())
}

#[tokio::test]
async fn aliases_rehome_foreign_paths_during_merge() -> Result<()> {
    let mut local = memory_data();
    local.add_lines(&lines_map(&[("/local/src/f.py", &[1])])).await?;
    let mut remote = memory_data();
    remote
        .add_lines(&lines_map(&[("/remote/src/f.py", &[2])]))
        .await?;

    let mut aliases = PathAliases::new();
    aliases.add("/remote/src", "/local/src")?;
    local.update(&mut remote, Some(&aliases)).await?;

    assert_eq!(local.lines("/local/src/f.py").await?, Some(vec![1, 2]));
    assert_eq!(local.lines("/remote/src/f.py").await?, None);
    Ok(())
}

#[tokio::test]
async fn merging_agreeing_tracers_is_fine() -> Result<()> {
    let mut first = memory_data();
    first.add_lines(&lines_map(&[("f", &[1])])).await?;
    first.add_file_tracers(&tracer_map(&[("f", "plugin")])).await?;
    let mut second = memory_data();
    second.add_lines(&lines_map(&[("f", &[2])])).await?;
    second
        .add_file_tracers(&tracer_map(&[("f", "plugin")]))
        .await?;

    first.update(&mut second, None).await?;
    assert_eq!(first.file_tracer("f").await?, Some("plugin".to_string()));
    assert_eq!(first.lines("f").await?, Some(vec![1, 2]));
    Ok(())
}

#[tokio::test]
async fn merging_conflicting_tracers_fails() -> Result<()> {
    let mut first = memory_data();
    first.add_lines(&lines_map(&[("f", &[1])])).await?;
    first.add_file_tracers(&tracer_map(&[("f", "plugin_a")])).await?;
    let mut second = memory_data();
    second.add_lines(&lines_map(&[("f", &[2])])).await?;
    second
        .add_file_tracers(&tracer_map(&[("f", "plugin_b")]))
        .await?;

    let err = first.update(&mut second, None).await.unwrap_err();
    assert!(matches!(err, CoverageError::Data(ref msg)
        if msg.contains("Conflicting file tracer name for 'f'")));
    Ok(())
}

#[tokio::test]
async fn merging_adopts_the_other_stores_tracer() -> Result<()> {
    let mut first = memory_data();
    first.add_lines(&lines_map(&[("f", &[1])])).await?;
    let mut second = memory_data();
    second.add_lines(&lines_map(&[("f", &[2])])).await?;
    second
        .add_file_tracers(&tracer_map(&[("f", "plugin")]))
        .await?;

    first.update(&mut second, None).await?;
    assert_eq!(first.file_tracer("f").await?, Some("plugin".to_string()));
    Ok(())
}

#[tokio::test]
async fn combining_parallel_files_recovers_the_union() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let base = utf8_dir(&dir).join(".coverage");

    for (suffix, lines) in [("w1", [1, 2]), ("w2", [2, 3])] {
        let mut worker = CoverageData::new(DataOptions {
            basename: Some(base.clone()),
            suffix: DataSuffix::Literal(suffix.to_string()),
            ..Default::default()
        });
        worker.add_lines(&lines_map(&[("f", &lines)])).await?;
    }

    let mut combined = CoverageData::new(DataOptions {
        basename: Some(base.clone()),
        ..Default::default()
    });
    for suffix in ["w1", "w2"] {
        let mut worker = CoverageData::new(DataOptions {
            basename: Some(base.clone()),
            suffix: DataSuffix::Literal(suffix.to_string()),
            ..Default::default()
        });
        worker.read().await?;
        combined.update(&mut worker, None).await?;
    }
    assert_eq!(combined.lines("f").await?, Some(vec![1, 2, 3]));

    // The combined result lands in the base file and survives reopening.
    drop(combined);
    let mut reopened = CoverageData::new(DataOptions {
        basename: Some(base),
        ..Default::default()
    });
    reopened.read().await?;
    assert_eq!(reopened.lines("f").await?, Some(vec![1, 2, 3]));
    Ok(())
}
