//! Transaction demarcation for background builds.

use crate::CacheResult;

/// Runs a unit of work inside a host transaction.
///
/// Background builds do not inherit the transaction of the caller that
/// triggered them, so the lazy strategy wraps every build in one of these.
pub trait TransactionalExecutor: Send + Sync {
    fn execute_in_transaction(&self, work: &mut dyn FnMut() -> CacheResult<()>) -> CacheResult<()>;
}

/// Executor that runs the work with no demarcation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

impl TransactionalExecutor for DirectExecutor {
    fn execute_in_transaction(&self, work: &mut dyn FnMut() -> CacheResult<()>) -> CacheResult<()> {
        work()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BuildError;

    #[test]
    fn test_direct_executor_runs_work_once() {
        let mut runs = 0;
        DirectExecutor
            .execute_in_transaction(&mut || {
                runs += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(runs, 1);
    }

    #[test]
    fn test_direct_executor_propagates_error() {
        let result = DirectExecutor.execute_in_transaction(&mut || Err(BuildError::Aborted.into()));
        assert!(result.is_err());
    }
}
