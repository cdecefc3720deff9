//! 有序回调注册表
//!
//! 回调按注册顺序触发。通知时先复制一份快照再释放锁，
//! 因此回调内部注册或注销回调不会破坏正在进行的遍历。

use std::sync::{Arc, Mutex, MutexGuard};

struct Entries<T: ?Sized> {
    next_id: u64,
    items: Vec<(u64, Arc<T>)>,
}

pub struct CallbackRegistry<T: ?Sized> {
    entries: Mutex<Entries<T>>,
}

impl<T: ?Sized> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> CallbackRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                next_id: 1,
                items: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries<T>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 注册回调，返回用于注销的编号
    pub fn register(&self, callback: Arc<T>) -> u64 {
        let mut entries = self.lock();
        let id = entries.next_id;
        entries.next_id += 1;
        entries.items.push((id, callback));
        id
    }

    /// 注销回调；重复注销返回 false
    pub fn remove(&self, id: u64) -> bool {
        let mut entries = self.lock();
        let before = entries.items.len();
        entries.items.retain(|(entry_id, _)| *entry_id != id);
        entries.items.len() != before
    }

    /// 按注册顺序复制当前回调
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.lock()
            .items
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }

    pub fn clear(&self) {
        self.lock().items.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
