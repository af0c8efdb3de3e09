use super::*;
use anyhow::Result;
use rayon::prelude::*;

#[test]
fn test_with_threads() -> Result<()> {
    let executor = ParallelExecutor::with_threads(3)?;

    assert_eq!(executor.threads(), 3);
    assert!(executor.is_dedicated());
    assert!(format!("{executor:?}").contains("threads: 3"));
    Ok(())
}

#[test]
fn test_zero_threads_is_an_error() {
    assert!(ParallelExecutor::with_threads(0).is_err());
}

#[test]
fn test_default_shares_global_pool() {
    let executor = ParallelExecutor::default();

    assert!(!executor.is_dedicated());
    assert_eq!(executor.threads(), rayon::current_num_threads());
    assert!(format!("{executor:?}").contains("dedicated: false"));
}

#[test]
fn test_global_install_waits_for_nested_work() {
    let executor = ParallelExecutor::new();
    let mut out = vec![0usize; 1000];

    executor.install(|| out.par_iter_mut().enumerate().for_each(|(i, val)| *val = i + 1));

    assert!(out.iter().enumerate().all(|(i, &val)| val == i + 1));
}

#[test]
fn test_install_waits_for_nested_work() -> Result<()> {
    let executor = ParallelExecutor::with_threads(2)?;
    let mut out = vec![0usize; 1000];

    let name = executor.install(|| {
        out.par_iter_mut().enumerate().for_each(|(i, val)| *val = i * 2);
        std::thread::current().name().map(str::to_owned)
    });

    assert!(out.iter().enumerate().all(|(i, &val)| val == i * 2));
    assert!(name.is_some_and(|name| name.starts_with("llama3-worker-")));
    Ok(())
}
