use serde::{Deserialize, Serialize};
use thiserror::Error;

/// DXF 颜色引用：调色板索引（ACI）或真彩色。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorRef {
    Aci(u8),
    Rgb(u8, u8, u8),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ColorError {
    #[error("颜色索引 {0} 超出 ACI 范围 0..=255")]
    IndexOutOfRange(i32),
}

/// ACI 默认调色板（256 项），索引 0 为 BYBLOCK 占位。
pub const DXF_DEFAULT_COLORS: [u32; 256] = [
    0x000000, 0xFF0000, 0xFFFF00, 0x00FF00, 0x00FFFF, 0x0000FF, 0xFF00FF, 0xFFFFFF,
    0x808080, 0xC0C0C0, 0xFF0000, 0xFF7F7F, 0xA50000, 0xA55252, 0x7F0000, 0x7F3F3F,
    0x4C0000, 0x4C2626, 0x260000, 0x261313, 0xFF3F00, 0xFF9F7F, 0xA52900, 0xA56752,
    0x7F1F00, 0x7F4F3F, 0x4C1300, 0x4C2F26, 0x260900, 0x261713, 0xFF7F00, 0xFFBF7F,
    0xA55200, 0xA57B52, 0x7F3F00, 0x7F5F3F, 0x4C2600, 0x4C3926, 0x261300, 0x261C13,
    0xFFBF00, 0xFFDF7F, 0xA57B00, 0xA59052, 0x7F5F00, 0x7F6F3F, 0x4C3900, 0x4C4226,
    0x261C00, 0x262113, 0xFFFF00, 0xFFFF7F, 0xA5A500, 0xA5A552, 0x7F7F00, 0x7F7F3F,
    0x4C4C00, 0x4C4C26, 0x262600, 0x262613, 0xBFFF00, 0xDFFF7F, 0x7BA500, 0x90A552,
    0x5F7F00, 0x6F7F3F, 0x394C00, 0x424C26, 0x1C2600, 0x212613, 0x7FFF00, 0xBFFF7F,
    0x52A500, 0x7BA552, 0x3F7F00, 0x5F7F3F, 0x264C00, 0x394C26, 0x132600, 0x1C2613,
    0x3FFF00, 0x9FFF7F, 0x29A500, 0x67A552, 0x1F7F00, 0x4F7F3F, 0x134C00, 0x2F4C26,
    0x092600, 0x172613, 0x00FF00, 0x7FFF7F, 0x00A500, 0x52A552, 0x007F00, 0x3F7F3F,
    0x004C00, 0x264C26, 0x002600, 0x132613, 0x00FF3F, 0x7FFF9F, 0x00A529, 0x52A567,
    0x007F1F, 0x3F7F4F, 0x004C13, 0x264C2F, 0x002609, 0x132617, 0x00FF7F, 0x7FFFBF,
    0x00A552, 0x52A57B, 0x007F3F, 0x3F7F5F, 0x004C26, 0x264C39, 0x002613, 0x13261C,
    0x00FFBF, 0x7FFFDF, 0x00A57B, 0x52A590, 0x007F5F, 0x3F7F6F, 0x004C39, 0x264C42,
    0x00261C, 0x132621, 0x00FFFF, 0x7FFFFF, 0x00A5A5, 0x52A5A5, 0x007F7F, 0x3F7F7F,
    0x004C4C, 0x264C4C, 0x002626, 0x132626, 0x00BFFF, 0x7FDFFF, 0x007BA5, 0x5290A5,
    0x005F7F, 0x3F6F7F, 0x00394C, 0x26424C, 0x001C26, 0x132126, 0x007FFF, 0x7FBFFF,
    0x0052A5, 0x527BA5, 0x003F7F, 0x3F5F7F, 0x00264C, 0x26394C, 0x001326, 0x131C26,
    0x003FFF, 0x7F9FFF, 0x0029A5, 0x5267A5, 0x001F7F, 0x3F4F7F, 0x00134C, 0x262F4C,
    0x000926, 0x131726, 0x0000FF, 0x7F7FFF, 0x0000A5, 0x5252A5, 0x00007F, 0x3F3F7F,
    0x00004C, 0x26264C, 0x000026, 0x131326, 0x3F00FF, 0x9F7FFF, 0x2900A5, 0x6752A5,
    0x1F007F, 0x4F3F7F, 0x13004C, 0x2F264C, 0x090026, 0x171326, 0x7F00FF, 0xBF7FFF,
    0x5200A5, 0x7B52A5, 0x3F007F, 0x5F3F7F, 0x26004C, 0x39264C, 0x130026, 0x1C1326,
    0xBF00FF, 0xDF7FFF, 0x7B00A5, 0x9052A5, 0x5F007F, 0x6F3F7F, 0x39004C, 0x42264C,
    0x1C0026, 0x211326, 0xFF00FF, 0xFF7FFF, 0xA500A5, 0xA552A5, 0x7F007F, 0x7F3F7F,
    0x4C004C, 0x4C264C, 0x260026, 0x261326, 0xFF00BF, 0xFF7FDF, 0xA5007B, 0xA55290,
    0x7F005F, 0x7F3F6F, 0x4C0039, 0x4C2642, 0x26001C, 0x261321, 0xFF007F, 0xFF7FBF,
    0xA50052, 0xA5527B, 0x7F003F, 0x7F3F5F, 0x4C0026, 0x4C2639, 0x260013, 0x26131C,
    0xFF003F, 0xFF7F9F, 0xA50029, 0xA55267, 0x7F001F, 0x7F3F4F, 0x4C0013, 0x4C262F,
    0x260009, 0x261317, 0x333333, 0x5B5B5B, 0x848484, 0xADADAD, 0xD6D6D6, 0xFFFFFF,
];

impl ColorRef {
    /// 从 DXF 组码 62 的值构造。负值表示图层关闭，只取绝对值。
    pub fn from_aci(raw: i32) -> Result<Self, ColorError> {
        let index = raw.unsigned_abs();
        u8::try_from(index)
            .map(ColorRef::Aci)
            .map_err(|_| ColorError::IndexOutOfRange(raw))
    }

    /// 从 DXF 组码 420 的 24 位真彩色值构造。
    pub fn from_true_color(raw: u32) -> Self {
        ColorRef::Rgb(
            ((raw >> 16) & 0xFF) as u8,
            ((raw >> 8) & 0xFF) as u8,
            (raw & 0xFF) as u8,
        )
    }

    /// 转换为 `#RRGGBB`：真彩色使用小写，调色板颜色使用大写。
    pub fn to_hex(self) -> String {
        match self {
            ColorRef::Rgb(r, g, b) => format!("#{r:02x}{g:02x}{b:02x}"),
            ColorRef::Aci(index) => format!("#{:06X}", DXF_DEFAULT_COLORS[usize::from(index)]),
        }
    }
}

impl Default for ColorRef {
    fn default() -> Self {
        ColorRef::Aci(7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_index_maps_to_uppercase_hex() {
        assert_eq!(ColorRef::Aci(1).to_hex(), "#FF0000");
        assert_eq!(ColorRef::Aci(5).to_hex(), "#0000FF");
        assert_eq!(ColorRef::Aci(7).to_hex(), "#FFFFFF");
        assert_eq!(ColorRef::Aci(30).to_hex(), "#FF7F00");
    }

    #[test]
    fn true_color_maps_to_lowercase_hex() {
        assert_eq!(ColorRef::Rgb(0, 255, 0).to_hex(), "#00ff00");
        assert_eq!(ColorRef::from_true_color(0x12AB3C).to_hex(), "#12ab3c");
    }

    #[test]
    fn every_palette_index_has_a_value() {
        for index in 0..=255u8 {
            let hex = ColorRef::Aci(index).to_hex();
            assert_eq!(hex.len(), 7, "索引 {index} 的输出 {hex} 长度异常");
            assert!(hex.starts_with('#'));
            assert_eq!(hex, ColorRef::Aci(index).to_hex());
        }
    }

    #[test]
    fn negative_index_means_layer_off() {
        assert_eq!(ColorRef::from_aci(-3), Ok(ColorRef::Aci(3)));
        assert_eq!(ColorRef::from_aci(256), Err(ColorError::IndexOutOfRange(256)));
    }
}
