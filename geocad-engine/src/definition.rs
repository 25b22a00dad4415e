//! GEODATA 中坐标系定义 XML 的生成与读取。

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::GeodataError;

static ALIAS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<Alias\b[^>]*\btype\s*=\s*"CoordinateSystem"[^>]*>(.*?)</Alias>"#)
        .expect("Alias 正则无效")
});
static OBJECT_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<ObjectId>\s*EPSG\s*=\s*([^<\s]*)\s*</ObjectId>").expect("ObjectId 正则无效")
});
static AXIS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<CoordinateSystemAxis>(.*?)</CoordinateSystemAxis>").expect("Axis 正则无效")
});
static AXIS_ORDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<AxisOrder>\s*(\d+)\s*</AxisOrder>").expect("AxisOrder 正则无效"));
static AXIS_DIRECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<AxisDirection>\s*(\w+)\s*</AxisDirection>").expect("AxisDirection 正则无效")
});

/// 从坐标系定义读出的信息。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrsDefinitionInfo {
    pub epsg: u32,
    /// 第一轴指向东（或 x）。转换时总是按 x 在前处理，此值仅用于诊断。
    pub easting_first: bool,
}

/// 生成以 `code` 为别名、东/北两轴（米）的坐标系定义。
pub fn synthesize(code: u32) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-16" standalone="no" ?>
<Dictionary version="1.0" xmlns="http://www.osgeo.org/mapguide/coordinatesystem">
  <Alias id="{code}" type="CoordinateSystem">
    <ObjectId>EPSG={code}</ObjectId>
    <Namespace>EPSG Code</Namespace>
  </Alias>
  <Axis uom="METER">
    <CoordinateSystemAxis>
      <AxisOrder>1</AxisOrder>
      <AxisName>Easting</AxisName>
      <AxisAbbreviation>E</AxisAbbreviation>
      <AxisDirection>east</AxisDirection>
    </CoordinateSystemAxis>
    <CoordinateSystemAxis>
      <AxisOrder>2</AxisOrder>
      <AxisName>Northing</AxisName>
      <AxisAbbreviation>N</AxisAbbreviation>
      <AxisDirection>north</AxisDirection>
    </CoordinateSystemAxis>
  </Axis>
</Dictionary>"#
    )
}

/// 解析 EPSG 别名与轴序。缺少任何一项都视为定义不可用。
pub fn parse(definition: &str) -> Result<CrsDefinitionInfo, GeodataError> {
    if definition.trim().is_empty() {
        return Err(GeodataError::Empty);
    }

    let epsg = ALIAS
        .captures_iter(definition)
        .find_map(|alias| {
            let body = alias.get(1)?.as_str();
            OBJECT_ID
                .captures(body)
                .and_then(|id| id.get(1))
                .map(|code| code.as_str().to_string())
        })
        .ok_or(GeodataError::MissingEpsgAlias)?;
    let epsg = epsg
        .parse::<u32>()
        .map_err(|_| GeodataError::InvalidEpsgCode(epsg.clone()))?;

    let mut axes: Vec<(u32, String)> = AXIS
        .captures_iter(definition)
        .filter_map(|axis| {
            let body = axis.get(1)?.as_str();
            let order = AXIS_ORDER.captures(body)?.get(1)?.as_str().parse().ok()?;
            let direction = AXIS_DIRECTION
                .captures(body)
                .and_then(|direction| direction.get(1))
                .map(|direction| direction.as_str().to_ascii_lowercase())
                .unwrap_or_default();
            Some((order, direction))
        })
        .collect();
    if axes.len() < 2 {
        return Err(GeodataError::MissingAxisOrder);
    }
    axes.sort_by_key(|(order, _)| *order);

    Ok(CrsDefinitionInfo {
        epsg,
        easting_first: matches!(axes[0].1.as_str(), "east" | "west" | ""),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_definition_parses_back() {
        let info = parse(&synthesize(32633)).expect("解析失败");
        assert_eq!(info.epsg, 32633);
        assert!(info.easting_first);
    }

    #[test]
    fn missing_axis_order_is_rejected() {
        let definition = synthesize(32633).replace("<AxisOrder>2</AxisOrder>", "");
        assert_eq!(parse(&definition), Err(GeodataError::MissingAxisOrder));
    }

    #[test]
    fn missing_alias_is_rejected() {
        assert_eq!(
            parse("<Dictionary><Axis/></Dictionary>"),
            Err(GeodataError::MissingEpsgAlias)
        );
        assert_eq!(parse("   "), Err(GeodataError::Empty));
    }

    #[test]
    fn non_numeric_code_is_rejected() {
        let definition = synthesize(32633).replace("EPSG=32633", "EPSG=UTM33");
        assert_eq!(
            parse(&definition),
            Err(GeodataError::InvalidEpsgCode("UTM33".to_string()))
        );
    }

    #[test]
    fn northing_first_axis_is_reported() {
        let definition = synthesize(4326)
            .replace("<AxisOrder>1</AxisOrder>", "<AxisOrder>3</AxisOrder>");
        let info = parse(&definition).expect("解析失败");
        assert!(!info.easting_first);
    }
}
