/// 迁移进度订阅
///
/// 每个实例一组订阅者，编排器推送进度事件；只转发订阅之后发生的事件。
/// 订阅者的发送端被移除后，对应的 HTTP 流随之结束。

use common::models::WatchEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

struct Subscriber {
    id: Uuid,
    sender: mpsc::UnboundedSender<WatchEvent>,
}

/// 订阅管理器
#[derive(Clone, Default)]
pub struct WatchHub {
    /// vm_uuid -> 订阅者
    subscribers: Arc<RwLock<HashMap<Uuid, Vec<Subscriber>>>>,
}

impl WatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册订阅者，返回订阅 ID 与事件接收端
    pub async fn subscribe(&self, vm_uuid: Uuid) -> (Uuid, mpsc::UnboundedReceiver<WatchEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let mut subscribers = self.subscribers.write().await;
        let list = subscribers.entry(vm_uuid).or_default();
        // 清理接收端已断开的订阅者
        list.retain(|s| !s.sender.is_closed());
        list.push(Subscriber { id, sender });

        info!("迁移进度订阅已注册: vm={}, subscription={}", vm_uuid, id);
        (id, receiver)
    }

    pub async fn unsubscribe(&self, vm_uuid: Uuid, id: Uuid) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(list) = subscribers.get_mut(&vm_uuid) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subscribers.remove(&vm_uuid);
            }
        }
    }

    /// 推送事件，顺带清理已断开的订阅者
    pub async fn publish(&self, vm_uuid: Uuid, event: &WatchEvent) -> usize {
        let mut subscribers = self.subscribers.write().await;
        let Some(list) = subscribers.get_mut(&vm_uuid) else {
            return 0;
        };

        list.retain(|s| s.sender.send(event.clone()).is_ok());
        let count = list.len();
        if list.is_empty() {
            subscribers.remove(&vm_uuid);
        }

        debug!("迁移进度已推送到 {} 个订阅者: vm={}", count, vm_uuid);
        count
    }

    /// 推送阶段结束事件
    ///
    /// `keep_open` 为 true 时（自动模式继续下一阶段）保留订阅，否则关闭所有流。
    pub async fn end_phase(&self, vm_uuid: Uuid, event: &WatchEvent, keep_open: bool) {
        self.publish(vm_uuid, event).await;
        if !keep_open {
            self.close(vm_uuid).await;
        }
    }

    /// 关闭该实例的所有订阅
    pub async fn close(&self, vm_uuid: Uuid) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(list) = subscribers.remove(&vm_uuid) {
            info!("迁移进度订阅已关闭: vm={}, count={}", vm_uuid, list.len());
        }
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self, vm_uuid: Uuid) -> usize {
        let subscribers = self.subscribers.read().await;
        subscribers.get(&vm_uuid).map(|l| l.len()).unwrap_or(0)
    }
}
