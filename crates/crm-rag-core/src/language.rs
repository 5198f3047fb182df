//! Language detection, sentiment scoring, and per-language store settings
//! for the multi-language catalog.
//!
//! Both classifiers are strategy traits ([`LanguageDetector`],
//! [`SentimentScorer`]) with keyword-list implementations, so a model-based
//! classifier can replace them without touching callers.
//!
//! # Detection order
//!
//! [`KeywordLanguageDetector`] tests languages in the order of
//! [`LANGUAGE_RULES`] and returns the first that qualifies. A language
//! qualifies on one strong seed word, or on two distinct weak seed words.
//! Weak words are short function words that also occur in related
//! languages. English is not in the table: it is the fallback.

use serde::Serialize;

/// Seed words for one language.
#[derive(Debug, Clone, Copy)]
pub struct LanguageRule {
    pub code: &'static str,
    /// One match is enough.
    pub strong: &'static [&'static str],
    /// Two distinct matches are needed.
    pub weak: &'static [&'static str],
}

pub const LANGUAGE_RULES: &[LanguageRule] = &[
    LanguageRule {
        code: "sl",
        strong: &["hvala", "prosim", "pozdravljeni", "lep", "zanima", "naročilo", "cena", "kupiti", "rabim"],
        weak: &["je", "in", "za", "na", "se", "ali", "kaj"],
    },
    LanguageRule {
        code: "hr",
        strong: &["molim", "cijena", "poštovani", "narudžba", "trebam", "lijep", "pozdrav"],
        weak: &["je", "i", "za", "na", "se", "da", "što"],
    },
    LanguageRule {
        code: "de",
        strong: &["danke", "dank", "bitte", "preis", "können", "vielen", "guten", "freundlichen", "grüße", "bestellung"],
        weak: &["ich", "sie", "und", "der", "die", "das", "mir", "den", "ist"],
    },
    LanguageRule {
        code: "it",
        strong: &["grazie", "prezzo", "buongiorno", "vorrei", "ordine", "cordiali", "saluti"],
        weak: &["il", "la", "di", "che", "per", "un", "è"],
    },
    LanguageRule {
        code: "fr",
        strong: &["merci", "bonjour", "prix", "commande", "cordialement", "voudrais"],
        weak: &["je", "le", "la", "de", "et", "vous", "est"],
    },
    LanguageRule {
        code: "es",
        strong: &["gracias", "hola", "precio", "pedido", "quisiera", "saludos"],
        weak: &["el", "la", "de", "que", "por", "para", "es"],
    },
    LanguageRule {
        code: "nl",
        strong: &["bedankt", "alstublieft", "prijs", "bestelling", "graag", "groeten"],
        weak: &["het", "een", "ik", "van", "de", "en", "is"],
    },
    LanguageRule {
        code: "pl",
        strong: &["dziękuję", "proszę", "zamówienie", "dzień", "pozdrawiam"],
        weak: &["jest", "nie", "się", "na", "i", "w"],
    },
    LanguageRule {
        code: "cs",
        strong: &["děkuji", "prosím", "objednávka", "dobrý", "potřebuji"],
        weak: &["je", "se", "na", "že", "a"],
    },
    LanguageRule {
        code: "sk",
        strong: &["ďakujem", "potrebujem", "pozdravom", "objednávku"],
        weak: &["je", "sa", "na", "že", "a"],
    },
    LanguageRule {
        code: "hu",
        strong: &["köszönöm", "kérem", "rendelés", "üdvözlettel", "szia", "ár"],
        weak: &["a", "az", "és", "hogy", "nem"],
    },
    LanguageRule {
        code: "pt",
        strong: &["obrigado", "obrigada", "preço", "encomenda", "olá", "cumprimentos"],
        weak: &["o", "os", "de", "que", "não", "para"],
    },
];

pub const DEFAULT_LANGUAGE: &str = "en";

/// Strategy for guessing the language of free text.
pub trait LanguageDetector: Send + Sync {
    /// Two-letter code, or `None` when nothing qualifies.
    fn detect(&self, text: &str) -> Option<&'static str>;
}

#[derive(Debug, Clone, Copy)]
pub struct KeywordLanguageDetector {
    rules: &'static [LanguageRule],
}

impl KeywordLanguageDetector {
    pub fn new() -> Self {
        Self {
            rules: LANGUAGE_RULES,
        }
    }
}

impl Default for KeywordLanguageDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

impl LanguageDetector for KeywordLanguageDetector {
    /// Strong words are checked across every rule before any weak pair, so
    /// common short words never shadow a later language's strong match.
    fn detect(&self, text: &str) -> Option<&'static str> {
        let tokens = words(text);
        let has = |w: &&str| tokens.iter().any(|t| t == w);

        self.rules
            .iter()
            .find(|rule| rule.strong.iter().any(has))
            .or_else(|| {
                self.rules
                    .iter()
                    .find(|rule| rule.weak.iter().filter(|w| has(*w)).count() >= 2)
            })
            .map(|rule| rule.code)
    }
}

/// Storefront settings for one catalog language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreConfig {
    pub language: &'static str,
    pub country: &'static str,
    pub currency: &'static str,
    pub store_code: &'static str,
    /// 1 for primary markets, 2 otherwise.
    pub priority: u8,
}

pub const STORE_CONFIGS: &[StoreConfig] = &[
    StoreConfig { language: "sl", country: "SI", currency: "EUR", store_code: "si", priority: 1 },
    StoreConfig { language: "en", country: "GB", currency: "EUR", store_code: "en", priority: 1 },
    StoreConfig { language: "de", country: "DE", currency: "EUR", store_code: "de", priority: 1 },
    StoreConfig { language: "it", country: "IT", currency: "EUR", store_code: "it", priority: 1 },
    StoreConfig { language: "hr", country: "HR", currency: "EUR", store_code: "hr", priority: 2 },
    StoreConfig { language: "fr", country: "FR", currency: "EUR", store_code: "fr", priority: 2 },
    StoreConfig { language: "es", country: "ES", currency: "EUR", store_code: "es", priority: 2 },
    StoreConfig { language: "nl", country: "NL", currency: "EUR", store_code: "nl", priority: 2 },
    StoreConfig { language: "pl", country: "PL", currency: "PLN", store_code: "pl", priority: 2 },
    StoreConfig { language: "cs", country: "CZ", currency: "CZK", store_code: "cz", priority: 2 },
    StoreConfig { language: "sk", country: "SK", currency: "EUR", store_code: "sk", priority: 2 },
    StoreConfig { language: "hu", country: "HU", currency: "HUF", store_code: "hu", priority: 2 },
    StoreConfig { language: "pt", country: "PT", currency: "EUR", store_code: "pt", priority: 2 },
];

pub fn store_config(language: &str) -> Option<&'static StoreConfig> {
    STORE_CONFIGS.iter().find(|c| c.language == language)
}

/// Detected language mapped onto a supported store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LanguageMatch {
    pub store: &'static StoreConfig,
    /// False when the store comes from the fallback language.
    pub detected: bool,
}

/// Detect the language of `text` and map it to a store, falling back to
/// `default_language` (then [`DEFAULT_LANGUAGE`]) when detection fails or
/// the code has no store.
pub fn resolve_store(
    detector: &dyn LanguageDetector,
    text: &str,
    default_language: &str,
) -> LanguageMatch {
    if let Some(store) = detector.detect(text).and_then(store_config) {
        return LanguageMatch {
            store,
            detected: true,
        };
    }
    let store = store_config(default_language)
        .or_else(|| store_config(DEFAULT_LANGUAGE))
        .unwrap_or(&STORE_CONFIGS[1]);
    LanguageMatch {
        store,
        detected: false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sentiment {
    /// In `[-1, 1]`.
    pub score: f64,
    pub label: SentimentLabel,
}

/// Strategy for scoring the tone of free text.
pub trait SentimentScorer: Send + Sync {
    fn score(&self, text: &str) -> Sentiment;
}

const POSITIVE_WORDS: &[&str] = &[
    "thanks", "thank", "great", "excellent", "happy", "love", "perfect", "hvala", "odlično", "super",
    "danke", "toll", "grazie", "ottimo", "merci", "parfait", "gracias", "bedankt",
];

const NEGATIVE_WORDS: &[&str] = &[
    "broken", "damaged", "late", "refund", "complaint", "disappointed", "angry", "wrong", "missing",
    "reklamacija", "pokvarjen", "zamuda", "kaputt", "beschwerde", "defekt", "rotto", "reclamo",
    "cassé", "plainte", "roto", "defect",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordSentimentScorer;

impl SentimentScorer for KeywordSentimentScorer {
    fn score(&self, text: &str) -> Sentiment {
        let tokens = words(text);
        let pos = tokens.iter().filter(|t| POSITIVE_WORDS.contains(&t.as_str())).count() as f64;
        let neg = tokens.iter().filter(|t| NEGATIVE_WORDS.contains(&t.as_str())).count() as f64;
        let score = if pos + neg == 0.0 {
            0.0
        } else {
            (pos - neg) / (pos + neg)
        };
        let label = if score > 0.2 {
            SentimentLabel::Positive
        } else if score < -0.2 {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        };
        Sentiment { score, label }
    }
}

/// Canned phrases for a reply in one language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTemplate {
    pub greeting: &'static str,
    pub apology: &'static str,
    pub intro: &'static str,
    pub closing: &'static str,
}

pub fn reply_template(language: &str) -> ReplyTemplate {
    match language {
        "sl" => ReplyTemplate {
            greeting: "Pozdravljeni,",
            apology: "opravičujemo se za nevšečnosti.",
            intro: "Morda vas zanimajo naslednji izdelki:",
            closing: "Lep pozdrav,",
        },
        "de" => ReplyTemplate {
            greeting: "Guten Tag,",
            apology: "wir entschuldigen uns für die Unannehmlichkeiten.",
            intro: "Folgende Produkte könnten Sie interessieren:",
            closing: "Mit freundlichen Grüßen,",
        },
        "it" => ReplyTemplate {
            greeting: "Buongiorno,",
            apology: "ci scusiamo per l'inconveniente.",
            intro: "Potrebbero interessarle i seguenti prodotti:",
            closing: "Cordiali saluti,",
        },
        "hr" => ReplyTemplate {
            greeting: "Poštovani,",
            apology: "ispričavamo se zbog neugodnosti.",
            intro: "Možda vas zanimaju sljedeći proizvodi:",
            closing: "Lijep pozdrav,",
        },
        "fr" => ReplyTemplate {
            greeting: "Bonjour,",
            apology: "nous nous excusons pour la gêne occasionnée.",
            intro: "Les produits suivants pourraient vous intéresser :",
            closing: "Cordialement,",
        },
        "es" => ReplyTemplate {
            greeting: "Hola,",
            apology: "lamentamos las molestias.",
            intro: "Estos productos podrían interesarle:",
            closing: "Saludos cordiales,",
        },
        _ => ReplyTemplate {
            greeting: "Hello,",
            apology: "we apologise for the inconvenience.",
            intro: "You may be interested in the following products:",
            closing: "Kind regards,",
        },
    }
}

/// Reply skeleton: greeting, optional apology, product lines, closing.
pub fn reply_skeleton(language: &str, sentiment: &Sentiment, products: &[String]) -> String {
    let t = reply_template(language);
    let mut out = String::from(t.greeting);
    out.push_str("\n\n");
    if sentiment.label == SentimentLabel::Negative {
        let mut chars = t.apology.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
        out.push_str("\n\n");
    }
    if !products.is_empty() {
        out.push_str(t.intro);
        out.push('\n');
        for p in products {
            out.push_str("- ");
            out.push_str(p);
            out.push('\n');
        }
        out.push('\n');
    }
    out.push_str(t.closing);
    out
}
