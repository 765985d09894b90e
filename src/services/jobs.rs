//! # 작업 슬롯과 페이지 잠금
//!
//! - `JobRegistry`: 스토리 ID당 작업 슬롯을 관리합니다.
//!   - 단독(exclusive) 슬롯: 단계 실행, 리비전 복원 등 스토리 전체를 바꾸는 작업. 스토리당 하나.
//!   - 공유(shared) 슬롯: 페이지 이미지 재생성/복원. 서로는 함께 돌 수 있지만 단독 작업과는 배타적입니다.
//!   - 충돌하면 대기하지 않고 즉시 `JobInProgress`로 실패합니다.
//! - `PageLocks`: (story_id, page_number) 단위로 활성 이미지 전환을 직렬화합니다.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

use crate::error::AppError;

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Exclusive,
    /// 실행 중인 페이지 작업 수
    Shared(usize),
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// 진행 중인 스토리 작업 목록
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    active: Slots,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 스토리의 단독 슬롯을 차지합니다. 다른 작업이 하나라도 있으면 `JobInProgress`.
    ///
    /// 반환된 가드가 drop될 때 슬롯이 풀립니다.
    pub fn try_acquire(&self, story_id: &str) -> Result<JobGuard, AppError> {
        let mut active = lock_ignoring_poison(&self.active);
        if active.contains_key(story_id) {
            tracing::debug!(story_id = %story_id, "Rejected job, slot already taken");
            return Err(AppError::JobInProgress(story_id.to_string()));
        }
        active.insert(story_id.to_string(), Slot::Exclusive);

        Ok(JobGuard {
            story_id: story_id.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    /// 페이지 작업용 공유 슬롯을 차지합니다. 단독 작업이 돌고 있으면 `JobInProgress`.
    pub fn try_share(&self, story_id: &str) -> Result<JobGuard, AppError> {
        let mut active = lock_ignoring_poison(&self.active);
        let slot = active
            .entry(story_id.to_string())
            .or_insert(Slot::Shared(0));
        match slot {
            Slot::Exclusive => {
                tracing::debug!(story_id = %story_id, "Rejected page action, story job running");
                return Err(AppError::JobInProgress(story_id.to_string()));
            }
            Slot::Shared(count) => *count += 1,
        }

        Ok(JobGuard {
            story_id: story_id.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    #[cfg(test)]
    pub fn is_busy(&self, story_id: &str) -> bool {
        lock_ignoring_poison(&self.active).contains_key(story_id)
    }
}

/// 스토리 작업 슬롯 점유권 (단독 또는 공유)
#[derive(Debug)]
pub struct JobGuard {
    story_id: String,
    active: Slots,
}

impl JobGuard {
    pub fn story_id(&self) -> &str {
        &self.story_id
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut active = lock_ignoring_poison(&self.active);
        let release = match active.get_mut(&self.story_id) {
            Some(Slot::Shared(count)) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if release {
            active.remove(&self.story_id);
        }
    }
}

/// 페이지 단위 비동기 잠금
#[derive(Debug, Clone, Default)]
pub struct PageLocks {
    locks: Arc<Mutex<HashMap<(String, i64), Arc<tokio::sync::Mutex<()>>>>>,
}

impl PageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 페이지 잠금을 얻을 때까지 기다립니다.
    pub async fn lock(&self, story_id: &str, page_number: i64) -> OwnedMutexGuard<()> {
        let page_lock = {
            let mut locks = lock_ignoring_poison(&self.locks);
            Arc::clone(
                locks
                    .entry((story_id.to_string(), page_number))
                    .or_default(),
            )
        };
        page_lock.lock_owned().await
    }
}
