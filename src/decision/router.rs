//! Per-task backend selection.

use std::sync::Arc;

use super::{DecisionBackend, DecisionKind};

/// Short launch/navigation requests the local loop handles on its own.
const SIMPLE_KEYWORDS: &[&str] = &[
    "回到桌面", "回到首页", "返回桌面", "返回首页", "打开", "启动", "关闭", "截图", "截屏", "返回",
    "后退", "open", "launch", "close", "go home", "go back", "screenshot",
];

/// Multi-step activities; two or more in one task means orchestration.
const MULTI_STEP_KEYWORDS: &[&str] = &[
    "刷", "浏览", "逛", "购买", "下单", "支付", "搜索", "查找", "找到", "发送", "转发", "分享", "登录",
    "注册", "browse", "scroll", "buy", "order", "pay", "search", "find", "send", "forward",
    "share", "log in", "login", "sign up",
];

/// Duration bounds.
const TIME_KEYWORDS: &[&str] = &["分钟", "小时", "秒", "minute", "hour", "second"];

/// Branching and repetition.
const CONTROL_KEYWORDS: &[&str] = &[
    "如果", "否则", "直到", "每隔", "每次", "重复", "遍", "次", "if ", "unless", "until",
    "otherwise", "repeat", "every ", "times", "each ",
];

const SIMPLE_TASK_MAX_CHARS: usize = 20;

/// Route a task by its text.
///
/// Time-bounded, conditional, counting and multi-step tasks go to the
/// remote workflow; everything else stays on the local step loop.
pub fn classify(task: &str) -> DecisionKind {
    let text = task.to_lowercase();
    let has = |kw: &&str| text.contains(*kw);

    let has_time = TIME_KEYWORDS.iter().any(has);
    if !has_time
        && task.chars().count() < SIMPLE_TASK_MAX_CHARS
        && SIMPLE_KEYWORDS.iter().any(has)
    {
        return DecisionKind::LocalStep;
    }

    let multi_step = MULTI_STEP_KEYWORDS.iter().filter(|kw| has(*kw)).count();
    if has_time || multi_step >= 2 || CONTROL_KEYWORDS.iter().any(has) {
        DecisionKind::RemoteWorkflow
    } else {
        DecisionKind::LocalStep
    }
}

/// Holds the configured backends and resolves a [`DecisionKind`] to one.
#[derive(Clone)]
pub struct DecisionRouter {
    local: Arc<dyn DecisionBackend>,
    remote: Option<Arc<dyn DecisionBackend>>,
}

impl DecisionRouter {
    pub fn new(local: Arc<dyn DecisionBackend>) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn DecisionBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Kind to stamp on a new step: explicit choice first, then [`classify`].
    pub fn route(&self, task: &str, explicit: Option<DecisionKind>) -> DecisionKind {
        explicit.unwrap_or_else(|| classify(task))
    }

    /// Backend for `kind`; remote falls back to local when not configured.
    pub fn backend(&self, kind: DecisionKind) -> Arc<dyn DecisionBackend> {
        match (kind, &self.remote) {
            (DecisionKind::RemoteWorkflow, Some(remote)) => Arc::clone(remote),
            (DecisionKind::RemoteWorkflow, None) => {
                tracing::debug!("No remote workflow configured, using local step decision");
                Arc::clone(&self.local)
            }
            (DecisionKind::LocalStep, _) => Arc::clone(&self.local),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    #[test]
    fn test_simple_tasks_stay_local() {
        assert_eq!(classify("打开微信"), DecisionKind::LocalStep);
        assert_eq!(classify("回到桌面"), DecisionKind::LocalStep);
        assert_eq!(classify("Open Settings"), DecisionKind::LocalStep);
    }

    #[test]
    fn test_time_bounded_tasks_go_remote() {
        assert_eq!(classify("刷抖音10分钟"), DecisionKind::RemoteWorkflow);
        assert_eq!(
            classify("browse the news feed for 5 minutes"),
            DecisionKind::RemoteWorkflow
        );
    }

    #[test]
    fn test_multi_step_and_conditional_tasks_go_remote() {
        assert_eq!(
            classify("在淘宝搜索耳机然后购买最便宜的"),
            DecisionKind::RemoteWorkflow
        );
        assert_eq!(
            classify("如果有新消息就回复收到"),
            DecisionKind::RemoteWorkflow
        );
        assert_eq!(classify("like 3 posts, 3 times"), DecisionKind::RemoteWorkflow);
    }

    #[test]
    fn test_single_activity_is_local() {
        assert_eq!(classify("在美团上查找附近的咖啡店并查看评分"), DecisionKind::LocalStep);
    }

    #[test]
    fn test_explicit_kind_wins() {
        let router = DecisionRouter::new(Arc::new(ScriptedBackend::new(vec![])));
        assert_eq!(
            router.route("打开微信", Some(DecisionKind::RemoteWorkflow)),
            DecisionKind::RemoteWorkflow
        );
    }

    #[test]
    fn test_remote_falls_back_to_local() {
        let local = Arc::new(ScriptedBackend::new(vec![]));
        let router = DecisionRouter::new(local);
        assert_eq!(
            router.backend(DecisionKind::RemoteWorkflow).kind(),
            DecisionKind::LocalStep
        );

        let remote = Arc::new(ScriptedBackend::new(vec![]).with_kind(DecisionKind::RemoteWorkflow));
        let router = router.with_remote(remote);
        assert_eq!(
            router.backend(DecisionKind::RemoteWorkflow).kind(),
            DecisionKind::RemoteWorkflow
        );
    }
}
