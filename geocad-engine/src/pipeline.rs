//! 保存、重建与导出流程：解析锚点 → 构造转换 → 提取记录 → 原子提交。

use std::sync::PoisonError;

use geocad_core::color::ColorRef;
use geocad_io::{DocumentLoader, DxfFacade};
use serde::Serialize;
use tracing::{info, warn};

use crate::crs::CrsRegistry;
use crate::errors::EngineError;
use crate::extract::{EntityExtractor, Extraction, ExtractionRules};
use crate::records::{
    Drawing, DrawingId, DrawingUpdate, EntityRecord, EntityRecordId, LayerId, LayerRecord,
    NewDrawing, source_digest,
};
use crate::resolver::{CrsResolver, ResolveContext};
use crate::store::{DerivedRecords, DrawingStore};
use crate::transform::CoordinateTransformer;
use crate::utm::{UtmZoneLookup, WgsUtmZones};
use crate::writer::GeodataWriter;

/// 图层的外观修改。`None` 表示保持不变。
#[derive(Debug, Clone, Default)]
pub struct LayerStyle {
    /// `#RRGGBB` 或 ACI 索引（如 `"1"`）。
    pub color: Option<String>,
    pub continuous_linetype: Option<bool>,
}

/// 实体清单中的一行，供 CSV 导出使用。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsvRow {
    pub layer: String,
    pub entity: EntityRecordId,
    /// GeoJSON `GeometryCollection` 文本。
    pub geometry: String,
}

pub struct Pipeline {
    store: DrawingStore,
    registry: CrsRegistry,
    utm: Box<dyn UtmZoneLookup>,
    rules: ExtractionRules,
    loader: DxfFacade,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(CrsRegistry::new(), ExtractionRules::default())
    }
}

impl Pipeline {
    pub fn new(registry: CrsRegistry, rules: ExtractionRules) -> Self {
        Self {
            store: DrawingStore::new(),
            registry,
            utm: Box::new(WgsUtmZones),
            rules,
            loader: DxfFacade::new(),
        }
    }

    pub fn with_utm_lookup(mut self, lookup: impl UtmZoneLookup + 'static) -> Self {
        self.utm = Box::new(lookup);
        self
    }

    #[inline]
    pub fn store(&self) -> &DrawingStore {
        &self.store
    }

    /// 登记新图纸并完成首次解析与提取。失败时不会留下任何记录。
    pub fn create(&self, request: NewDrawing) -> Result<Drawing, EngineError> {
        if let Some(manual) = &request.manual {
            manual.validate()?;
        }
        if let Some(parent) = request.parent {
            if !self.store.contains(parent) {
                return Err(EngineError::ParentNotFound(parent));
            }
        }

        let text = request.source.read()?;
        let drawing = Drawing {
            id: self.store.next_drawing_id(),
            title: request.title,
            parent: request.parent,
            source: request.source,
            source_digest: source_digest(&text),
            manual: request.manual,
            georef: None,
            needs_refresh: true,
            version: 0,
        };
        let (drawing, derived) = self.rebuild(drawing, &text, true)?;
        info!(
            drawing = %drawing.id,
            anchored = drawing.is_anchored(),
            layers = derived.layers.len(),
            "图纸已创建"
        );
        Ok(self.store.insert(drawing, derived))
    }

    /// 应用修改。只有源文件内容、父图纸或手动锚点真正变化时才重建。
    pub fn update(&self, id: DrawingId, update: DrawingUpdate) -> Result<Drawing, EngineError> {
        let lock = self.store.rebuild_lock(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.store.drawing(id)?;
        if let Some(Some(manual)) = &update.manual {
            manual.validate()?;
        }
        if let Some(Some(parent)) = update.parent {
            if parent == id {
                return Err(EngineError::InvalidParent(id));
            }
            if !self.store.contains(parent) {
                return Err(EngineError::ParentNotFound(parent));
            }
        }

        let mut next = current.clone();
        if let Some(title) = update.title {
            next.title = title;
        }
        if let Some(parent) = update.parent {
            next.parent = parent;
        }
        if let Some(manual) = update.manual {
            next.manual = manual;
        }
        let new_text = match update.source {
            Some(source) => {
                let text = source.read()?;
                next.source = source;
                next.source_digest = source_digest(&text);
                Some(text)
            }
            None => None,
        };

        let source_changed = next.source_digest != current.source_digest;
        let parent_changed = next.parent != current.parent;
        let manual_changed = next.manual != current.manual;
        if !(source_changed || parent_changed || manual_changed) {
            return self.store.commit_rebuild(current.version, next, None);
        }

        if parent_changed || manual_changed {
            // 重新走一遍解析顺序
            next.georef = None;
        }
        let text = match new_text {
            Some(text) => text,
            None => next.source.read()?,
        };
        // 导出写入的 GEODATA 只反映旧锚点，重新配准时不能让它抢先
        let use_geodata = source_changed || !current.is_anchored();
        let (next, derived) = self.rebuild(next, &text, use_geodata)?;
        info!(
            drawing = %id,
            source_changed,
            parent_changed,
            manual_changed,
            "图纸已重建"
        );
        self.store
            .commit_rebuild(current.version, next, Some(derived))
    }

    /// 返回可下载的 DXF 文本。锚点变化后首次导出时写入 GEODATA 并保存，
    /// 之后直到下一次锚点变化都直接返回已保存的文件。
    pub fn export(&self, id: DrawingId) -> Result<String, EngineError> {
        let lock = self.store.rebuild_lock(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let drawing = self.store.drawing(id)?;
        let text = drawing.source.read()?;
        if !drawing.needs_refresh || !drawing.is_anchored() {
            return Ok(text);
        }

        let output = GeodataWriter::new(&self.registry).embed(&text, &drawing)?;
        let mut next = drawing.clone();
        next.source.write(output.clone())?;
        next.source_digest = source_digest(&output);
        next.needs_refresh = false;
        self.store.commit_rebuild(drawing.version, next, None)?;
        Ok(output)
    }

    pub fn update_layer_style(
        &self,
        layer: LayerId,
        style: LayerStyle,
    ) -> Result<LayerRecord, EngineError> {
        let mut record = self.store.layer(layer)?;
        if let Some(color) = style.color {
            record.color_hex = normalize_color(&color)?;
        }
        if let Some(continuous) = style.continuous_linetype {
            record.continuous_linetype = continuous;
        }
        self.store.update_layer(record)
    }

    pub fn delete(&self, id: DrawingId) -> Result<(), EngineError> {
        let lock = self.store.rebuild_lock(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = self.store.delete(id)?;
        info!(drawing = %id, title = %removed.title, "图纸已删除");
        Ok(())
    }

    /// 按图层顺序列出图纸的全部实体。
    pub fn entities_csv_rows(&self, id: DrawingId) -> Result<Vec<CsvRow>, EngineError> {
        if !self.store.contains(id) {
            return Err(EngineError::DrawingNotFound(id));
        }
        let DerivedRecords { layers, entities } = self.store.snapshot(id);
        let mut rows = Vec::with_capacity(entities.len());
        for layer in &layers {
            for entity in entities.iter().filter(|entity| entity.layer == layer.id) {
                rows.push(CsvRow {
                    layer: layer.name.clone(),
                    entity: entity.id,
                    geometry: entity.geometry_geojson().to_string(),
                });
            }
        }
        Ok(rows)
    }

    /// 计算完整的新状态，不触碰存储。`use_geodata` 决定是否参考文件中的 GEODATA。
    fn rebuild(
        &self,
        mut drawing: Drawing,
        text: &str,
        use_geodata: bool,
    ) -> Result<(Drawing, DerivedRecords), EngineError> {
        let document = self.loader.load_str(text)?;
        let parent = match drawing.parent {
            Some(parent) => Some(
                self.store
                    .drawing(parent)
                    .map_err(|_| EngineError::ParentNotFound(parent))?,
            ),
            None => None,
        };
        let geodata = if use_geodata { document.geodata() } else { None };

        let resolver = CrsResolver::new(&self.registry, self.utm.as_ref());
        let resolved = resolver.resolve(&ResolveContext {
            drawing: &drawing,
            geodata,
            parent: parent.as_ref(),
        })?;
        if let Some(result) = resolved {
            drawing.georef = Some(result.georef);
        }
        drawing.needs_refresh = true;

        let Some(georef) = drawing.georef else {
            warn!(drawing = %drawing.id, "图纸未配准，不生成图层");
            return Ok((drawing, DerivedRecords::default()));
        };
        let transforms = CoordinateTransformer::new(&self.registry).build(&georef)?;
        let extraction = EntityExtractor::new(&self.rules).extract(&document, &transforms, &georef)?;
        let derived = self.materialize(drawing.id, extraction);
        Ok((drawing, derived))
    }

    fn materialize(&self, drawing: DrawingId, extraction: Extraction) -> DerivedRecords {
        let layers: Vec<LayerRecord> = extraction
            .layers
            .into_iter()
            .map(|layer| LayerRecord {
                id: self.store.next_layer_id(),
                drawing,
                name: layer.name,
                color_hex: layer.color_hex,
                continuous_linetype: layer.continuous_linetype,
                is_block: layer.is_block,
            })
            .collect();
        let entities = extraction
            .entities
            .into_iter()
            .map(|entity| EntityRecord {
                id: self.store.next_entity_id(),
                layer: layers[entity.layer].id,
                geometry: entity.geometry,
                insertion_point: entity.insertion_point,
                label: entity.label,
                data: entity.data,
            })
            .collect();
        DerivedRecords { layers, entities }
    }
}

/// 接受 `#RRGGBB`（保留大小写）或 ACI 索引。
fn normalize_color(raw: &str) -> Result<String, EngineError> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix('#') {
        if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(raw.to_string());
        }
        return Err(EngineError::InvalidColor(raw.to_string()));
    }
    let index = raw
        .parse::<i32>()
        .map_err(|_| EngineError::InvalidColor(raw.to_string()))?;
    Ok(ColorRef::from_aci(index)?.to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geocad_core::color::ColorError;

    #[test]
    fn colors_accept_hex_and_palette_indices() {
        assert_eq!(normalize_color("#00ff00").expect("颜色无效"), "#00ff00");
        assert_eq!(normalize_color("1").expect("颜色无效"), "#FF0000");
        assert!(matches!(
            normalize_color("#12345"),
            Err(EngineError::InvalidColor(_))
        ));
        assert!(matches!(
            normalize_color("300"),
            Err(EngineError::Color(ColorError::IndexOutOfRange(300)))
        ));
        assert!(matches!(
            normalize_color("red"),
            Err(EngineError::InvalidColor(_))
        ));
    }
}
