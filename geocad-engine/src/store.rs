//! 图纸及其派生图层、实体的内存存储。
//!
//! 派生记录只通过 [`DrawingStore::insert`] 与 [`DrawingStore::commit_rebuild`] 整体替换，
//! 两者都在同一次写锁内完成，读者看不到部分删除的状态。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::errors::EngineError;
use crate::records::{Drawing, DrawingId, EntityRecord, EntityRecordId, LayerId, LayerRecord};

/// 一次重建产生的派生记录。
#[derive(Debug, Clone, Default)]
pub struct DerivedRecords {
    pub layers: Vec<LayerRecord>,
    pub entities: Vec<EntityRecord>,
}

#[derive(Debug, Default)]
struct StoreState {
    drawings: BTreeMap<DrawingId, Drawing>,
    layers: BTreeMap<LayerId, LayerRecord>,
    entities: BTreeMap<EntityRecordId, EntityRecord>,
}

impl StoreState {
    /// 删除图纸的全部图层及其实体。
    fn remove_derived(&mut self, drawing: DrawingId) -> usize {
        let removed: BTreeSet<LayerId> = self
            .layers
            .values()
            .filter(|layer| layer.drawing == drawing)
            .map(|layer| layer.id)
            .collect();
        self.layers.retain(|id, _| !removed.contains(id));
        self.entities
            .retain(|_, entity| !removed.contains(&entity.layer));
        removed.len()
    }

    fn insert_derived(&mut self, derived: DerivedRecords) {
        for layer in derived.layers {
            self.layers.insert(layer.id, layer);
        }
        for entity in derived.entities {
            self.entities.insert(entity.id, entity);
        }
    }
}

#[derive(Debug)]
pub struct DrawingStore {
    state: RwLock<StoreState>,
    rebuild_locks: Mutex<HashMap<DrawingId, Arc<Mutex<()>>>>,
    next_drawing: AtomicU64,
    next_layer: AtomicU64,
    next_entity: AtomicU64,
}

impl Default for DrawingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DrawingStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            rebuild_locks: Mutex::new(HashMap::new()),
            next_drawing: AtomicU64::new(1),
            next_layer: AtomicU64::new(1),
            next_entity: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_drawing_id(&self) -> DrawingId {
        DrawingId::new(self.next_drawing.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_layer_id(&self) -> LayerId {
        LayerId::new(self.next_layer.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_entity_id(&self) -> EntityRecordId {
        EntityRecordId::new(self.next_entity.fetch_add(1, Ordering::Relaxed))
    }

    /// 同一图纸的重建互斥锁。持有期间其他重建、导出与删除都会等待。
    pub fn rebuild_lock(&self, id: DrawingId) -> Arc<Mutex<()>> {
        let mut locks = self
            .rebuild_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id).or_default())
    }

    /// 登记新图纸及其派生记录。
    pub fn insert(&self, drawing: Drawing, derived: DerivedRecords) -> Drawing {
        let mut state = self.write();
        state.insert_derived(derived);
        state.drawings.insert(drawing.id, drawing.clone());
        drawing
    }

    pub fn drawing(&self, id: DrawingId) -> Result<Drawing, EngineError> {
        self.read()
            .drawings
            .get(&id)
            .cloned()
            .ok_or(EngineError::DrawingNotFound(id))
    }

    pub fn drawings(&self) -> Vec<Drawing> {
        self.read().drawings.values().cloned().collect()
    }

    pub fn contains(&self, id: DrawingId) -> bool {
        self.read().drawings.contains_key(&id)
    }

    /// 图纸的图层，按创建顺序。
    pub fn layers_of(&self, drawing: DrawingId) -> Vec<LayerRecord> {
        self.read()
            .layers
            .values()
            .filter(|layer| layer.drawing == drawing)
            .cloned()
            .collect()
    }

    pub fn layer(&self, id: LayerId) -> Result<LayerRecord, EngineError> {
        self.read()
            .layers
            .get(&id)
            .cloned()
            .ok_or(EngineError::LayerNotFound(id))
    }

    pub fn entities_of(&self, layer: LayerId) -> Vec<EntityRecord> {
        self.read()
            .entities
            .values()
            .filter(|entity| entity.layer == layer)
            .cloned()
            .collect()
    }

    /// 图纸的全部派生记录，在同一次读锁内取得。
    pub fn snapshot(&self, drawing: DrawingId) -> DerivedRecords {
        let state = self.read();
        let layers: Vec<LayerRecord> = state
            .layers
            .values()
            .filter(|layer| layer.drawing == drawing)
            .cloned()
            .collect();
        let ids: BTreeSet<LayerId> = layers.iter().map(|layer| layer.id).collect();
        let entities = state
            .entities
            .values()
            .filter(|entity| ids.contains(&entity.layer))
            .cloned()
            .collect();
        DerivedRecords { layers, entities }
    }

    /// 以 `expected_version` 为前提替换图纸；`derived` 为 `Some` 时同时替换全部派生记录。
    pub fn commit_rebuild(
        &self,
        expected_version: u64,
        mut drawing: Drawing,
        derived: Option<DerivedRecords>,
    ) -> Result<Drawing, EngineError> {
        let mut state = self.write();
        let found = state
            .drawings
            .get(&drawing.id)
            .map(|current| current.version)
            .ok_or(EngineError::DrawingNotFound(drawing.id))?;
        if found != expected_version {
            return Err(EngineError::ConcurrentModification {
                id: drawing.id,
                expected: expected_version,
                found,
            });
        }

        if let Some(derived) = derived {
            let removed = state.remove_derived(drawing.id);
            debug!(drawing = %drawing.id, removed, added = derived.layers.len(), "替换派生图层");
            state.insert_derived(derived);
        }
        drawing.version = expected_version + 1;
        state.drawings.insert(drawing.id, drawing.clone());
        Ok(drawing)
    }

    pub fn update_layer(&self, layer: LayerRecord) -> Result<LayerRecord, EngineError> {
        let mut state = self.write();
        let slot = state
            .layers
            .get_mut(&layer.id)
            .ok_or(EngineError::LayerNotFound(layer.id))?;
        *slot = layer.clone();
        Ok(layer)
    }

    /// 删除图纸及其图层与实体；子图纸的父引用被清空，已有的锚点保持不变。
    pub fn delete(&self, id: DrawingId) -> Result<Drawing, EngineError> {
        let removed = {
            let mut state = self.write();
            let removed = state
                .drawings
                .remove(&id)
                .ok_or(EngineError::DrawingNotFound(id))?;
            state.remove_derived(id);
            for child in state.drawings.values_mut() {
                if child.parent == Some(id) {
                    child.parent = None;
                    child.version += 1;
                }
            }
            removed
        };
        self.rebuild_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::SourceFile;

    fn drawing(store: &DrawingStore, parent: Option<DrawingId>) -> Drawing {
        Drawing {
            id: store.next_drawing_id(),
            title: "plan".to_string(),
            parent,
            source: SourceFile::memory("plan.dxf", ""),
            source_digest: String::new(),
            manual: None,
            georef: None,
            needs_refresh: true,
            version: 0,
        }
    }

    fn derived(store: &DrawingStore, drawing: DrawingId, names: &[&str]) -> DerivedRecords {
        let mut records = DerivedRecords::default();
        for name in names {
            let layer = LayerRecord {
                id: store.next_layer_id(),
                drawing,
                name: (*name).to_string(),
                color_hex: "#FFFFFF".to_string(),
                continuous_linetype: true,
                is_block: false,
            };
            records.entities.push(EntityRecord {
                id: store.next_entity_id(),
                layer: layer.id,
                geometry: geo::GeometryCollection::from(vec![geo::Geometry::Point(
                    geo::Point::new(1.0, 2.0),
                )]),
                insertion_point: None,
                label: None,
                data: None,
            });
            records.layers.push(layer);
        }
        records
    }

    #[test]
    fn commit_replaces_derived_records_and_bumps_version() {
        let store = DrawingStore::new();
        let first = drawing(&store, None);
        let id = first.id;
        let records = derived(&store, id, &["Walls", "Doors"]);
        store.insert(first.clone(), records);
        assert_eq!(store.layers_of(id).len(), 2);

        let replacement = derived(&store, id, &["Trees"]);
        let committed = store
            .commit_rebuild(0, first, Some(replacement))
            .expect("提交失败");
        assert_eq!(committed.version, 1);
        let layers = store.layers_of(id);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].name, "Trees");
        assert_eq!(store.snapshot(id).entities.len(), 1);
    }

    #[test]
    fn stale_version_is_rejected_without_changes() {
        let store = DrawingStore::new();
        let first = drawing(&store, None);
        let id = first.id;
        store.insert(first.clone(), derived(&store, id, &["Walls"]));
        store
            .commit_rebuild(0, first.clone(), None)
            .expect("提交失败");

        let err = store
            .commit_rebuild(0, first, Some(DerivedRecords::default()))
            .expect_err("过期版本应被拒绝");
        assert!(matches!(
            err,
            EngineError::ConcurrentModification {
                expected: 0,
                found: 1,
                ..
            }
        ));
        assert_eq!(store.layers_of(id).len(), 1);
    }

    #[test]
    fn delete_cascades_and_detaches_children() {
        let store = DrawingStore::new();
        let parent = drawing(&store, None);
        let parent_id = parent.id;
        store.insert(parent, derived(&store, parent_id, &["Walls"]));
        let child = drawing(&store, Some(parent_id));
        let child_id = child.id;
        store.insert(child, derived(&store, child_id, &["Trees"]));

        store.delete(parent_id).expect("删除失败");
        assert!(!store.contains(parent_id));
        assert!(store.layers_of(parent_id).is_empty());
        assert_eq!(store.snapshot(child_id).entities.len(), 1);
        assert_eq!(store.drawing(child_id).expect("子图纸应保留").parent, None);
        assert!(matches!(
            store.delete(parent_id),
            Err(EngineError::DrawingNotFound(_))
        ));
    }

    #[test]
    fn rebuild_lock_is_shared_per_drawing() {
        let store = DrawingStore::new();
        let first = store.rebuild_lock(DrawingId::new(1));
        let again = store.rebuild_lock(DrawingId::new(1));
        let other = store.rebuild_lock(DrawingId::new(2));
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
