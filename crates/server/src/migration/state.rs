/// 迁移状态机转换表
///
/// 每个请求只在这里判断一次动作是否合法。

use common::models::{MigrationAction, MigrationPhase, MigrationRecord, MigrationState};
use common::{Error, Result};

use common::models::MigrationAction as A;
use common::models::MigrationPhase as P;
use common::models::MigrationState as S;

/// 当前位置：无迁移记录，或 (phase, state)
pub type Position = Option<(MigrationPhase, MigrationState)>;

pub fn position(record: Option<&MigrationRecord>) -> Position {
    record.map(|r| (r.phase, r.state))
}

/// 动作在当前位置是否合法
///
/// switch 成功的记录是终态，视同无迁移：允许 estimate 与新的 begin。
pub fn allowed(position: Position, action: MigrationAction) -> bool {
    let position = match position {
        Some((P::Switch, S::Successful)) if matches!(action, A::Estimate | A::Begin) => None,
        other => other,
    };

    match (position, action) {
        (None, A::Estimate | A::Begin) => true,

        (Some((P::Begin, S::Successful | S::Paused)), A::Sync) => true,
        // sync 可以在成功后重复执行（增量同步），失败后也可直接重试
        (Some((P::Sync, S::Successful | S::Paused | S::Failed)), A::Sync) => true,

        (Some((P::Sync, S::Successful | S::Paused)), A::Switch) => true,

        (Some((P::Begin | P::Sync, S::Running | S::Successful)), A::Pause) => true,

        (Some((P::Begin | P::Sync, _)), A::Abort) => true,
        (Some((P::Switch, S::Failed)), A::Abort) => true,

        (Some((P::Switch, S::Successful)), A::Finalize) => true,

        _ => false,
    }
}

/// 检查转换，不合法时返回对应错误
pub fn check_transition(vm_uuid: &uuid::Uuid, position: Position, action: MigrationAction) -> Result<()> {
    if allowed(position, action) {
        return Ok(());
    }

    Err(match position {
        None => Error::not_found(format!("No migration found for VM {}", vm_uuid)),
        Some((P::Switch, S::Successful)) => Error::precondition(format!(
            "Cannot {} a migration that has already switched",
            action
        )),
        Some((phase, state)) if action == A::Begin => Error::precondition(format!(
            "A migration is already in progress for VM {} (phase {}, state {})",
            vm_uuid, phase, state
        )),
        Some((phase, S::Paused)) if action == A::Pause => Error::precondition(format!(
            "Migration is already paused in phase {}",
            phase
        )),
        Some((phase, state)) => Error::precondition(format!(
            "Cannot {} a migration in phase {} with state {}",
            action, phase, state
        )),
    })
}
