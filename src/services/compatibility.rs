//! Static zone/category compatibility table.

use crate::models::placement::ProductCategory;
use crate::models::scene::ZoneType;

/// Whether a product of `category` may be placed in a zone of `zone`.
pub fn is_compatible(zone: ZoneType, category: ProductCategory) -> bool {
    use ProductCategory::*;
    match zone {
        ZoneType::Hand => matches!(category, Beverage | Phone | SmallItem | Food),
        ZoneType::Surface => true,
        ZoneType::Wall => matches!(category, Poster | Logo | Billboard),
        ZoneType::Screen => matches!(category, Digital | Ad | Logo),
        ZoneType::Clothing => matches!(category, Logo | Brand),
    }
}

/// Zone types a category may land in, in table order.
pub fn compatible_zones(category: ProductCategory) -> Vec<ZoneType> {
    ZoneType::ALL
        .into_iter()
        .filter(|zone| is_compatible(*zone, category))
        .collect()
}

/// Human-readable reason a pairing is allowed.
pub fn rationale(zone: ZoneType, category: ProductCategory) -> String {
    let why = match zone {
        ZoneType::Hand => "handheld products read naturally in a hand",
        ZoneType::Surface => "any product can rest on a surface",
        ZoneType::Wall => "flat printed media hangs on walls",
        ZoneType::Screen => "digital creative can be shown on screens",
        ZoneType::Clothing => "marks and brands can be worn",
    };
    format!("{} fits a {} zone: {}", category, zone, why)
}
