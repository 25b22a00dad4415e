use tracing::{debug, info};

use geocad_io::{DocumentLoader, DxfFacade, GeodataInjector};

use crate::crs::CrsRegistry;
use crate::errors::EngineError;
use crate::records::Drawing;
use crate::transform::CoordinateTransformer;

/// 把图纸当前锚点写回 DXF 的 GEODATA 对象。
///
/// 使用与提取相同的 [`Transforms::effective_geodata`](crate::transform::Transforms::effective_geodata)，
/// 导出的文件与已存储的实体记录总是基于同一套变换。
#[derive(Debug, Clone, Copy)]
pub struct GeodataWriter<'a> {
    registry: &'a CrsRegistry,
}

impl<'a> GeodataWriter<'a> {
    pub fn new(registry: &'a CrsRegistry) -> Self {
        Self { registry }
    }

    /// 返回嵌入地理数据后的 DXF 文本。未配准的图纸原样返回。
    pub fn embed(&self, source: &str, drawing: &Drawing) -> Result<String, EngineError> {
        let Some(georef) = drawing.georef else {
            debug!(drawing = %drawing.id, "图纸未配准，跳过 GEODATA 写入");
            return Ok(source.to_string());
        };
        let document = DxfFacade::new().load_str(source)?;
        let transforms = CoordinateTransformer::new(self.registry).build(&georef)?;
        let geodata = transforms.effective_geodata(&document, &georef);
        let output = GeodataInjector::new().inject(source, &geodata)?;
        info!(drawing = %drawing.id, epsg = georef.crs, "GEODATA 已写入");
        Ok(output)
    }
}
