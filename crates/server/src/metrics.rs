/// Prometheus 指标
///
/// 启动时调用 `init` 注册；未初始化时（例如单元测试）记录操作为空操作。

use once_cell::sync::OnceCell;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

struct Metrics {
    registry: Registry,
    agents_connected: IntGauge,
    jobs_submitted: IntCounterVec,
    jobs_finished: IntCounterVec,
    migration_phases: IntCounterVec,
}

static METRICS: OnceCell<Metrics> = OnceCell::new();

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("instance_api".to_string()), None)?;

        let agents_connected = IntGauge::new("agents_connected", "已连接的 Agent 数量")?;
        let jobs_submitted = IntCounterVec::new(
            Opts::new("jobs_submitted_total", "已提交的任务数"),
            &["kind"],
        )?;
        let jobs_finished = IntCounterVec::new(
            Opts::new("jobs_finished_total", "已结束的任务数"),
            &["kind", "execution"],
        )?;
        let migration_phases = IntCounterVec::new(
            Opts::new("migration_phases_total", "已结束的迁移阶段数"),
            &["phase", "state"],
        )?;

        registry.register(Box::new(agents_connected.clone()))?;
        registry.register(Box::new(jobs_submitted.clone()))?;
        registry.register(Box::new(jobs_finished.clone()))?;
        registry.register(Box::new(migration_phases.clone()))?;

        Ok(Self {
            registry,
            agents_connected,
            jobs_submitted,
            jobs_finished,
            migration_phases,
        })
    }
}

/// 注册全部指标，重复调用无副作用
pub fn init() -> prometheus::Result<()> {
    METRICS.get_or_try_init(Metrics::new).map(|_| ())
}

pub fn agent_connected() {
    if let Some(m) = METRICS.get() {
        m.agents_connected.inc();
    }
}

pub fn agent_disconnected() {
    if let Some(m) = METRICS.get() {
        m.agents_connected.dec();
    }
}

pub fn job_submitted(kind: &str) {
    if let Some(m) = METRICS.get() {
        m.jobs_submitted.with_label_values(&[kind]).inc();
    }
}

pub fn job_finished(kind: &str, execution: &str) {
    if let Some(m) = METRICS.get() {
        m.jobs_finished.with_label_values(&[kind, execution]).inc();
    }
}

pub fn migration_phase_finished(phase: &str, state: &str) {
    if let Some(m) = METRICS.get() {
        m.migration_phases.with_label_values(&[phase, state]).inc();
    }
}

/// 以文本格式导出
pub fn render() -> Result<String, String> {
    let Some(m) = METRICS.get() else {
        return Ok(String::new());
    };
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&m.registry.gather(), &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_after_init() {
        init().unwrap();
        init().unwrap();
        job_submitted("migrate_begin");
        migration_phase_finished("begin", "successful");

        let text = render().unwrap();
        assert!(text.contains("instance_api_jobs_submitted_total{kind=\"migrate_begin\"}"));
        assert!(text.contains("instance_api_migration_phases_total"));
    }
}
