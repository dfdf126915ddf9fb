//! Per-transaction dirty tracking.
//!
//! A [`DirtyTransactions`] set is owned by exactly one published `Dirty`
//! state. It is never mutated in place: adding or removing a transaction
//! produces a new set that travels with the next state, so a set observed by
//! a reader never changes underneath it.

use crate::TransactionId;
use std::collections::BTreeSet;

/// Transactions that changed cached data and have not completed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyTransactions {
    transactions: BTreeSet<TransactionId>,
}

impl DirtyTransactions {
    /// Tracker seeded with the first invalidating transaction.
    pub fn single(transaction: TransactionId) -> Self {
        let mut transactions = BTreeSet::new();
        transactions.insert(transaction);
        Self { transactions }
    }

    pub fn contains(&self, transaction: TransactionId) -> bool {
        self.transactions.contains(&transaction)
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.transactions.iter().copied()
    }

    /// Copy of this tracker that also contains `transaction`.
    /// A transaction already tracked is not added twice.
    pub fn with_transaction(&self, transaction: TransactionId) -> Self {
        let mut transactions = self.transactions.clone();
        transactions.insert(transaction);
        Self { transactions }
    }

    /// Copy of this tracker without `transaction`.
    pub fn without_transaction(&self, transaction: TransactionId) -> Self {
        let mut transactions = self.transactions.clone();
        transactions.remove(&transaction);
        Self { transactions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_tracked_at_most_once() {
        let tx = TransactionId::new();
        let tracker = DirtyTransactions::single(tx).with_transaction(tx);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.contains(tx));
    }

    #[test]
    fn test_removal_only_affects_named_transaction() {
        let tx1 = TransactionId::new();
        let tx2 = TransactionId::new();
        let tracker = DirtyTransactions::single(tx1).with_transaction(tx2);

        let after = tracker.without_transaction(tx1);
        assert!(!after.contains(tx1));
        assert!(after.contains(tx2));
        assert_eq!(after.len(), 1);

        // Source tracker is untouched.
        assert!(tracker.contains(tx1));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_removing_untracked_transaction_keeps_set() {
        let tx = TransactionId::new();
        let tracker = DirtyTransactions::single(tx);
        let after = tracker.without_transaction(TransactionId::new());
        assert_eq!(after, tracker);
    }

    #[test]
    fn test_empties_after_last_removal() {
        let tx = TransactionId::new();
        let tracker = DirtyTransactions::single(tx).without_transaction(tx);
        assert!(tracker.is_empty());
        assert_eq!(tracker.iter().count(), 0);
    }
}
