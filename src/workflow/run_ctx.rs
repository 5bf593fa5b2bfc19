//! 生成运行上下文
//!
//! 封装"我在为谁生成、这是哪个模式、事件发往哪里"这一信息

use std::fmt::Display;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RunError;
use crate::models::StageEvent;

/// 一次子运行的阶段数
pub const STAGES_PER_RUN: usize = 5;

/// 生成运行上下文
#[derive(Debug, Clone)]
pub struct RunCtx {
    /// 用户 ID
    pub user_id: String,

    /// 三题生成中的模式（A / B / C），单题生成时为 None
    pub pattern: Option<String>,

    /// 本子运行之前已经用掉的阶段数（模式序号 × 5）
    pub stage_offset: usize,

    /// 整个运行的阶段总数（5 或 15）
    pub total_stages: usize,

    events: mpsc::Sender<StageEvent>,
    cancel: CancellationToken,
}

impl RunCtx {
    /// 单题生成
    pub fn single(
        user_id: impl Into<String>,
        events: mpsc::Sender<StageEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            pattern: None,
            stage_offset: 0,
            total_stages: STAGES_PER_RUN,
            events,
            cancel,
        }
    }

    /// 三题生成中的第 `index` 个模式（从 0 开始）
    pub fn pattern(
        user_id: impl Into<String>,
        pattern: impl Into<String>,
        index: usize,
        pattern_count: usize,
        events: mpsc::Sender<StageEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            pattern: Some(pattern.into()),
            stage_offset: index * STAGES_PER_RUN,
            total_stages: pattern_count * STAGES_PER_RUN,
            events,
            cancel,
        }
    }

    /// 子运行内的阶段号（1..=5）换算为整个运行的阶段号
    pub fn global_stage(&self, stage: usize) -> usize {
        self.stage_offset + stage
    }

    /// 子运行内的阶段号，仅三题生成时返回
    pub fn pattern_stage(&self, stage: usize) -> Option<usize> {
        self.pattern.as_ref().map(|_| stage)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 发送事件
    ///
    /// 接收方已经关闭时取消整个运行并返回 `RunError::Cancelled`
    pub async fn emit(&self, event: StageEvent) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let tag = event.tag();
        if self.events.send(event).await.is_err() {
            debug!("{} 事件接收方已关闭，取消运行 (事件: {})", self, tag);
            self.cancel.cancel();
            return Err(RunError::Cancelled);
        }
        Ok(())
    }
}

impl Display for RunCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.pattern {
            Some(pattern) => write!(f, "[用户 {} パターン{}]", self.user_id, pattern),
            None => write!(f, "[用户 {}]", self.user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_stage_numbering() {
        let (tx, _rx) = mpsc::channel(1);
        let ctx = RunCtx::pattern("u1", "B", 1, 3, tx, CancellationToken::new());
        assert_eq!(ctx.global_stage(1), 6);
        assert_eq!(ctx.global_stage(5), 10);
        assert_eq!(ctx.total_stages, 15);
        assert_eq!(ctx.pattern_stage(2), Some(2));
        assert_eq!(ctx.to_string(), "[用户 u1 パターンB]");
    }

    #[tokio::test]
    async fn test_closed_receiver_cancels_run() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let ctx = RunCtx::single("u1", tx, CancellationToken::new());
        let event = StageEvent::Error {
            stage: 1,
            pattern: None,
            message: "x".to_string(),
        };
        assert!(matches!(ctx.emit(event).await, Err(RunError::Cancelled)));
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.pattern_stage(1), None);
    }
}
