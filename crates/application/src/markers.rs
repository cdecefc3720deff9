//! 地图标记对账
//!
//! 把上一次显示的标记集合与最新的附近用户集合对齐，只做最少的增删改：
//! 两边都有的标记原地更新，不销毁重建。自己的标记单独处理：当且仅当在线时存在，
//! 位置取本地最后已知位置而非查询结果。

use std::collections::{HashMap, HashSet};

use domain::{Coordinates, CurrentUser, NearbyEntity, UserId};
use tracing::debug;

/// 自己标记上的文字
pub const SELF_LABEL: &str = "You";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MarkerId {
    SelfMarker,
    Peer(UserId),
}

/// 标记的可见内容
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerView {
    pub position: Coordinates,
    pub label: String,
    pub avatar_url: Option<String>,
    pub icon: String,
    pub initials: String,
}

impl MarkerView {
    pub fn for_self(user: &CurrentUser) -> Self {
        Self {
            position: user.position,
            label: SELF_LABEL.to_owned(),
            avatar_url: user.avatar_url.clone(),
            icon: user.icon.clone(),
            initials: user.initials.clone(),
        }
    }

    pub fn for_peer(entity: &NearbyEntity) -> Self {
        Self {
            position: entity.position,
            label: entity.name.clone(),
            avatar_url: entity.avatar_url.clone(),
            icon: entity.icon.clone(),
            initials: entity.initials.clone(),
        }
    }
}

/// 显示层：每个标记对应一个可寻址的句柄
pub trait MarkerSurface {
    type Handle;

    fn create(&mut self, id: MarkerId, view: &MarkerView) -> Self::Handle;

    /// 原地更新位置与内容
    fn update(&mut self, handle: &mut Self::Handle, view: &MarkerView);

    fn destroy(&mut self, handle: Self::Handle);
}

/// 一次对账产生的变更
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<MarkerId>,
    pub updated: Vec<MarkerId>,
    pub removed: Vec<MarkerId>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

struct Displayed<H> {
    handle: H,
    view: MarkerView,
}

pub struct MarkerReconciler<S: MarkerSurface> {
    surface: S,
    displayed: HashMap<MarkerId, Displayed<S::Handle>>,
}

impl<S: MarkerSurface> MarkerReconciler<S> {
    pub fn new(surface: S) -> Self {
        Self {
            surface,
            displayed: HashMap::new(),
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn len(&self) -> usize {
        self.displayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.displayed.is_empty()
    }

    pub fn contains(&self, id: &MarkerId) -> bool {
        self.displayed.contains_key(id)
    }

    pub fn handle(&self, id: &MarkerId) -> Option<&S::Handle> {
        self.displayed.get(id).map(|displayed| &displayed.handle)
    }

    /// 当前显示的标记，按ID排序
    pub fn displayed_ids(&self) -> Vec<MarkerId> {
        let mut ids: Vec<MarkerId> = self.displayed.keys().copied().collect();
        ids.sort();
        ids
    }

    /// 对齐显示集合
    ///
    /// 不在线或没有身份时销毁全部标记（包括自己）。附近集合中的自己会被忽略，
    /// 重复的ID只取第一次出现。
    pub fn reconcile(
        &mut self,
        me: Option<&CurrentUser>,
        is_live: bool,
        nearby: &[NearbyEntity],
    ) -> ReconcileReport {
        let me = match me {
            Some(me) if is_live => me,
            _ => return self.clear(),
        };

        let mut report = ReconcileReport::default();

        let mut seen = HashSet::new();
        let targets: Vec<(MarkerId, MarkerView)> = nearby
            .iter()
            .filter(|entity| entity.id != me.id)
            .filter(|entity| seen.insert(entity.id))
            .map(|entity| (MarkerId::Peer(entity.id), MarkerView::for_peer(entity)))
            .collect();

        let mut stale: Vec<MarkerId> = self
            .displayed
            .keys()
            .filter(|id| match id {
                MarkerId::SelfMarker => false,
                MarkerId::Peer(peer) => !seen.contains(peer),
            })
            .copied()
            .collect();
        stale.sort();
        for id in stale {
            self.remove(id, &mut report);
        }

        self.upsert(MarkerId::SelfMarker, MarkerView::for_self(me), &mut report);
        for (id, view) in targets {
            self.upsert(id, view, &mut report);
        }

        debug!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            "标记对账完成"
        );
        report
    }

    /// 销毁全部标记
    pub fn clear(&mut self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for id in self.displayed_ids() {
            self.remove(id, &mut report);
        }
        report
    }

    fn remove(&mut self, id: MarkerId, report: &mut ReconcileReport) {
        if let Some(displayed) = self.displayed.remove(&id) {
            self.surface.destroy(displayed.handle);
            report.removed.push(id);
        }
    }

    fn upsert(&mut self, id: MarkerId, view: MarkerView, report: &mut ReconcileReport) {
        match self.displayed.get_mut(&id) {
            Some(displayed) => {
                if displayed.view != view {
                    self.surface.update(&mut displayed.handle, &view);
                    displayed.view = view;
                    report.updated.push(id);
                }
            }
            None => {
                let handle = self.surface.create(id, &view);
                self.displayed.insert(id, Displayed { handle, view });
                report.added.push(id);
            }
        }
    }
}
