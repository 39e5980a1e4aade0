//! Non-blocking list operations.
//!
//! Items pushed at the left end leave the right end first, so the right end
//! holds the oldest item and the left end the newest.

use tracing::info;

use crate::store::{Item, ListStore, StoreError};

/// Items taken from both ends of a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEnds {
    pub oldest: Option<Item>,
    pub newest: Option<Item>,
}

/// Replaces `key` with `Task 1` ..= `Task n`, pushed in that order.
///
/// # Errors
///
/// Returns the first store error; the list may be partially seeded.
pub async fn seed<S: ListStore>(store: &S, key: &str, n: u64) -> Result<u64, StoreError> {
    store.delete_key(key).await?;

    for i in 1..=n {
        let item = format!("Task {}", i);
        store.push_left(key, &item).await?;
        info!(list = %key, item = %item, "Added item to list");
    }

    Ok(n)
}

/// Pops the oldest item, then the newest one.
///
/// # Errors
///
/// Returns the first store error.
pub async fn take_oldest_and_newest<S: ListStore>(
    store: &S,
    key: &str,
) -> Result<ListEnds, StoreError> {
    let oldest = store.pop_right(key).await?;
    let newest = store.pop_left(key).await?;

    info!(
        list = %key,
        oldest = oldest.as_ref().map_or("<none>", Item::as_str),
        newest = newest.as_ref().map_or("<none>", Item::as_str),
        "Took both ends"
    );

    Ok(ListEnds { oldest, newest })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_seed_then_take_both_ends() {
        let store = MemoryStore::new();
        store.push_left("tasks", "stale").await.expect("push");

        assert_eq!(seed(&store, "tasks", 10).await.expect("seed"), 10);
        assert_eq!(store.len("tasks").await.expect("len"), 10);

        let ends = take_oldest_and_newest(&store, "tasks").await.expect("take");
        assert_eq!(ends.oldest, Some(Item::from("Task 1")));
        assert_eq!(ends.newest, Some(Item::from("Task 10")));
        assert_eq!(store.len("tasks").await.expect("len"), 8);
    }

    #[tokio::test]
    async fn test_single_item_list() {
        let store = MemoryStore::new();
        seed(&store, "tasks", 1).await.expect("seed");

        let ends = take_oldest_and_newest(&store, "tasks").await.expect("take");
        assert_eq!(ends.oldest, Some(Item::from("Task 1")));
        assert_eq!(ends.newest, None);
    }

    #[tokio::test]
    async fn test_empty_list() {
        let store = MemoryStore::new();
        seed(&store, "tasks", 0).await.expect("seed");

        let ends = take_oldest_and_newest(&store, "tasks").await.expect("take");
        assert_eq!(ends.oldest, None);
        assert_eq!(ends.newest, None);
    }
}
