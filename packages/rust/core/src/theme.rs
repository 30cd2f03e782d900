//! Weekly content calendar.
//!
//! [`resolve_theme`] maps a date to its weekday theme, applying special-date
//! overrides. Everything here is static data plus one computed rule (Día del
//! Padre), so resolution is pure and idempotent.

use chrono::{Datelike, NaiveDate, Weekday};
use serde::Serialize;

/// Post type forced on special dates.
pub const SPECIAL_DATE_POST_TYPE: &str = "Fechas importantes";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Whether a day's post should feature a catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStrategy {
    Required,
    Flexible,
    EducationalOnly,
}

/// The shape a day's topic must take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicFormat {
    /// `"<error> → <measurable damage> → <technique>"`.
    ErrorDamageSolution,
    /// A descriptive title without separators.
    PlainTitle,
}

/// Producer segment featured on Saturdays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sector {
    Forestry,
    Plant,
    Animal,
}

const SATURDAY_SECTORS: [Sector; 3] = [Sector::Forestry, Sector::Plant, Sector::Animal];

impl Sector {
    /// Deterministic rotation by ISO week number.
    pub fn for_iso_week(week: u32) -> Self {
        SATURDAY_SECTORS[(week % 3) as usize]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Forestry => "Forestal",
            Self::Plant => "Plantas/Cultivos",
            Self::Animal => "Ganadería",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Forestry => "🌲",
            Self::Plant => "🌾",
            Self::Animal => "🐄",
        }
    }

    /// Example topics for the sector brief.
    pub fn examples(&self) -> &'static [&'static str] {
        match self {
            Self::Forestry => &[
                "Sistemas de riego para viveros forestales en zonas semiáridas",
                "Cómo almacenar agua para tus viveros forestales",
            ],
            Self::Plant => &[
                "Riego eficiente en alfalfa: menos evaporación, más cortes",
                "FAQ: ¿cuándo es el mejor momento para fertilizar?",
            ],
            Self::Animal => &[
                "Sistemas de agua para ganado: prevenir fugas y reducir costos",
                "Evita fugas con abrazaderas resistentes en bebederos de ganado",
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialDateKind {
    Holiday,
    Social,
    Agricultural,
}

/// A calendar date that overrides the weekday theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpecialDate {
    pub name: &'static str,
    pub kind: SpecialDateKind,
}

// ---------------------------------------------------------------------------
// Static calendar
// ---------------------------------------------------------------------------

/// One row of the weekly calendar.
#[derive(Debug)]
pub struct WeekdayTheme {
    pub weekday: Weekday,
    pub day_name: &'static str,
    pub theme_label: &'static str,
    pub content_type: &'static str,
    pub primary_tone: &'static str,
    pub alternative_tones: &'static [&'static str],
    pub recommended_post_types: &'static [&'static str],
    pub product_strategy: ProductStrategy,
    pub topic_format: TopicFormat,
    pub rotates_sector: bool,
    pub guidance: &'static str,
}

pub static WEEKDAY_THEMES: [WeekdayTheme; 7] = [
    WeekdayTheme {
        weekday: Weekday::Mon,
        day_name: "Monday",
        theme_label: "✊ Motivational / Inspirational",
        content_type: "Frase o mensaje que inspire a productores agrícolas y forestales",
        primary_tone: "Motivational",
        alternative_tones: &["Inspirational", "Encouraging", "Humorous"],
        recommended_post_types: &[
            "Motivational Phrase or Quote of the Week",
            "Memes/tips rápidos",
            "Image / Photo of the Week",
        ],
        product_strategy: ProductStrategy::EducationalOnly,
        topic_format: TopicFormat::PlainTitle,
        rotates_sector: false,
        guidance: "Arranca la semana con un mensaje que reconozca el esfuerzo del productor. \
                   Sin productos ni precios.",
    },
    WeekdayTheme {
        weekday: Weekday::Tue,
        day_name: "Tuesday",
        theme_label: "💸 Promotion / Deals",
        content_type: "Un producto con precio especial, kit o promoción de temporada",
        primary_tone: "Promotional",
        alternative_tones: &["Sales-focused", "Urgent", "Humorous"],
        recommended_post_types: &[
            "Promoción puntual",
            "Kits",
            "\"Lo que llegó hoy\"",
            "Cómo pedir / logística",
            "Recordatorio de servicio",
        ],
        product_strategy: ProductStrategy::Required,
        topic_format: TopicFormat::ErrorDamageSolution,
        rotates_sector: false,
        guidance: "Parte de un error real del productor, cuantifica lo que le cuesta y \
                   presenta el producto como parte de la solución.",
    },
    WeekdayTheme {
        weekday: Weekday::Wed,
        day_name: "Wednesday",
        theme_label: "📚 Educational / Tips",
        content_type: "Tips, guías y contenido educativo para productores",
        primary_tone: "Educational",
        alternative_tones: &["Technical", "Informative", "Humorous"],
        recommended_post_types: &[
            "Infografías de producto o tema",
            "Tutorial corto",
            "Pro Tip",
            "Interesting Fact",
            "Article",
            "Sabías que...",
        ],
        product_strategy: ProductStrategy::EducationalOnly,
        topic_format: TopicFormat::PlainTitle,
        rotates_sector: false,
        guidance: "Enseña una práctica concreta que el productor pueda aplicar esta semana.",
    },
    WeekdayTheme {
        weekday: Weekday::Thu,
        day_name: "Thursday",
        theme_label: "🛠️ Problem & Solution",
        content_type: "Infografía que muestra cómo se resuelve un problema real del campo",
        primary_tone: "Problem-Solving",
        alternative_tones: &["Technical", "Solution-focused", "Educational"],
        recommended_post_types: &["Infografías", "Caso de éxito", "Antes / Después"],
        product_strategy: ProductStrategy::Flexible,
        topic_format: TopicFormat::ErrorDamageSolution,
        rotates_sector: false,
        guidance: "Muestra el error, el daño medible que provoca y la técnica que lo evita.",
    },
    WeekdayTheme {
        weekday: Weekday::Fri,
        day_name: "Friday",
        theme_label: "📅 Seasonal Focus",
        content_type: "Consejos o alertas según la temporada de cultivos, ganado o bosque",
        primary_tone: "Seasonal",
        alternative_tones: &["Educational", "Informative", "Technical"],
        recommended_post_types: &[
            "Infografías",
            "Tutorial corto",
            "Checklist operativo",
            "Recordatorio de servicio",
            "Seasonal weather tips: what to expect & how to act",
        ],
        product_strategy: ProductStrategy::Flexible,
        topic_format: TopicFormat::PlainTitle,
        rotates_sector: false,
        guidance: "Anticipa lo que viene en la temporada y qué hacer antes de que llegue.",
    },
    WeekdayTheme {
        weekday: Weekday::Sat,
        day_name: "Saturday",
        theme_label: "👩‍🌾 Producer Segment Focus",
        content_type: "Contenido rotativo para productores forestales, agrícolas y ganaderos",
        primary_tone: "Educational",
        alternative_tones: &["Technical", "Practical", "Humorous"],
        recommended_post_types: &[
            "Infografías",
            "FAQ / Mitos",
            "Pro Tip",
            "Interesting Fact",
            "Tutorial corto",
            "Recordatorio de servicio",
        ],
        product_strategy: ProductStrategy::EducationalOnly,
        topic_format: TopicFormat::PlainTitle,
        rotates_sector: true,
        guidance: "Habla solo al segmento de la semana, con su vocabulario y sus problemas.",
    },
    WeekdayTheme {
        weekday: Weekday::Sun,
        day_name: "Sunday",
        theme_label: "📊 Innovation / Industry Reports",
        content_type: "Noticias del sector, innovación agrícola o novedades relevantes",
        primary_tone: "Informative",
        alternative_tones: &["Technical", "Educational", "Humorous"],
        recommended_post_types: &[
            "Industry novelty",
            "Trivia agrotech-style post",
            "Statistics or report highlights relevant to audience",
        ],
        product_strategy: ProductStrategy::EducationalOnly,
        topic_format: TopicFormat::PlainTitle,
        rotates_sector: false,
        guidance: "Comparte una novedad o dato del sector y explica qué significa para el productor local.",
    },
];

/// Monday's second post.
pub static RANCH_LIFE_THEME: WeekdayTheme = WeekdayTheme {
    weekday: Weekday::Mon,
    day_name: "Monday",
    theme_label: "🌾 La Vida en el Rancho",
    content_type: "Historias y anécdotas de la vida en el rancho",
    primary_tone: "Nostalgic",
    alternative_tones: &["Reflective", "Personal", "Storytelling"],
    recommended_post_types: &[
        "Personal Story / Anecdote",
        "Ranch Life Reflection",
        "Photo of the Week with Story",
    ],
    product_strategy: ProductStrategy::EducationalOnly,
    topic_format: TopicFormat::PlainTitle,
    rotates_sector: false,
    guidance: "Experiencias auténticas del rancho: la rutina diaria, las tradiciones y el \
               vínculo con la tierra. Tono cálido y reflexivo, sin productos.",
};

/// Fixed-date overrides keyed by `(month, day)`.
pub static SPECIAL_DATES: &[((u32, u32), SpecialDate)] = &[
    ((1, 1), SpecialDate { name: "Año Nuevo", kind: SpecialDateKind::Holiday }),
    ((2, 5), SpecialDate { name: "Día de la Constitución", kind: SpecialDateKind::Holiday }),
    ((3, 21), SpecialDate { name: "Natalicio de Benito Juárez", kind: SpecialDateKind::Holiday }),
    ((3, 22), SpecialDate { name: "Día Mundial del Agua", kind: SpecialDateKind::Agricultural }),
    ((4, 15), SpecialDate { name: "Día del Agrónomo", kind: SpecialDateKind::Agricultural }),
    ((4, 22), SpecialDate { name: "Día de la Tierra", kind: SpecialDateKind::Agricultural }),
    ((5, 10), SpecialDate { name: "Día de las Madres", kind: SpecialDateKind::Social }),
    ((5, 15), SpecialDate { name: "Día del Maestro", kind: SpecialDateKind::Social }),
    ((6, 5), SpecialDate { name: "Día Mundial del Medio Ambiente", kind: SpecialDateKind::Agricultural }),
    ((9, 16), SpecialDate { name: "Día de la Independencia", kind: SpecialDateKind::Holiday }),
    ((10, 16), SpecialDate { name: "Día Mundial de la Alimentación", kind: SpecialDateKind::Agricultural }),
    ((11, 2), SpecialDate { name: "Día de Muertos", kind: SpecialDateKind::Holiday }),
    ((12, 25), SpecialDate { name: "Navidad", kind: SpecialDateKind::Holiday }),
];

const FATHERS_DAY: SpecialDate = SpecialDate {
    name: "Día del Padre",
    kind: SpecialDateKind::Social,
};

/// Regional context added to Friday prompts.
pub const SEASONAL_CONTEXT: &str = "Durango: clima semiárido en gran parte del estado, lluvias \
     concentradas en verano (julio a septiembre, ~500 mm anuales) y fuerte dependencia de pozos \
     para riego. Heladas de noviembre a febrero. Temporada de incendios forestales de enero a \
     junio, crítica de abril a junio. Siembras de temporal en junio y julio; cosecha de maíz y \
     frijol en octubre y noviembre. El sistema productivo gira en torno a forrajes, ganado \
     lechero y bosque; el principal problema de los productores es el costo de insumos.";

/// A short season note for the given month.
pub fn season_note(month: u32) -> &'static str {
    match month {
        12 | 1 | 2 => "Temporada de heladas: protección de cultivos, agua para ganado y viveros.",
        3 => "Fin de heladas y preparación de suelo; arranque de sistemas de riego.",
        4..=6 => "Estiaje y riesgo alto de incendios; máxima demanda de agua antes de las lluvias.",
        7..=9 => "Temporal de lluvias: siembra, control de maleza y manejo de excesos de agua.",
        _ => "Cosecha y almacenamiento; preparar equipos y protección antes de las heladas.",
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// The fully resolved theme for one calendar slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThemeDescriptor {
    pub date: NaiveDate,
    pub day_name: String,
    pub theme_label: String,
    pub content_type: String,
    pub primary_tone: String,
    pub alternative_tones: Vec<String>,
    /// Ranked, best first.
    pub recommended_post_types: Vec<String>,
    pub product_strategy: ProductStrategy,
    pub topic_format: TopicFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<Sector>,
    pub guidance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_date: Option<SpecialDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_post_type: Option<String>,
    /// Monday's ranch-life slot.
    pub second_post: bool,
}

impl ThemeDescriptor {
    fn from_row(date: NaiveDate, row: &WeekdayTheme, second_post: bool) -> Self {
        let sector = row
            .rotates_sector
            .then(|| Sector::for_iso_week(date.iso_week().week()));
        Self {
            date,
            day_name: row.day_name.to_string(),
            theme_label: row.theme_label.to_string(),
            content_type: row.content_type.to_string(),
            primary_tone: row.primary_tone.to_string(),
            alternative_tones: to_strings(row.alternative_tones),
            recommended_post_types: to_strings(row.recommended_post_types),
            product_strategy: row.product_strategy,
            topic_format: row.topic_format,
            sector,
            guidance: row.guidance.to_string(),
            special_date: None,
            forced_post_type: None,
            second_post,
        }
    }

    /// Replace label and guidance, force the post type. Format and product strategy stay.
    fn apply_special_date(mut self, special: SpecialDate) -> Self {
        self.theme_label = format!("📅 {}", special.name);
        self.guidance = format!(
            "Hoy es {}. Conecta la fecha con la vida y el trabajo del productor, con respeto y sin \
             forzar la venta.",
            special.name
        );
        self.forced_post_type = Some(SPECIAL_DATE_POST_TYPE.to_string());
        self.special_date = Some(special);
        self
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Resolve the theme for `date`, applying any special-date override.
pub fn resolve_theme(date: NaiveDate) -> ThemeDescriptor {
    let row = weekday_row(date.weekday());
    let theme = ThemeDescriptor::from_row(date, row, false);
    match special_date(date) {
        Some(special) => theme.apply_special_date(special),
        None => theme,
    }
}

/// Monday's second theme ("La Vida en el Rancho"); `None` on other days.
///
/// Special dates do not override the second post.
pub fn second_post_theme(date: NaiveDate) -> Option<ThemeDescriptor> {
    (date.weekday() == Weekday::Mon)
        .then(|| ThemeDescriptor::from_row(date, &RANCH_LIFE_THEME, true))
}

/// The special date falling on `date`, if any.
pub fn special_date(date: NaiveDate) -> Option<SpecialDate> {
    let key = (date.month(), date.day());
    if let Some((_, special)) = SPECIAL_DATES.iter().find(|(k, _)| *k == key) {
        return Some(*special);
    }
    // Third Sunday of June.
    let third_week = (date.day() - 1) / 7 + 1 == 3;
    (date.month() == 6 && date.weekday() == Weekday::Sun && third_week).then_some(FATHERS_DAY)
}

fn weekday_row(weekday: Weekday) -> &'static WeekdayTheme {
    &WEEKDAY_THEMES[weekday.num_days_from_monday() as usize]
}
