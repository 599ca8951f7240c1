use async_trait::async_trait;

use super::{CollaboratorError, RetrievalAnswer, RetrievalBackend};
use crate::extraction::{normalize_text, token_set};

#[derive(Clone, Debug, PartialEq)]
pub struct FaqEntry {
    pub keywords: Vec<String>,
    pub answer: String,
    pub source: String,
}

impl FaqEntry {
    pub fn new(keywords: &[&str], answer: &str, source: &str) -> Self {
        Self {
            keywords: keywords.iter().map(|keyword| normalize_text(keyword)).collect(),
            answer: answer.to_string(),
            source: source.to_string(),
        }
    }
}

/// Keyword-scored answers for the common product questions.
#[derive(Clone, Debug)]
pub struct FaqRetrieval {
    entries: Vec<FaqEntry>,
}

impl FaqRetrieval {
    pub fn new(entries: Vec<FaqEntry>) -> Self {
        Self { entries }
    }
}

impl Default for FaqRetrieval {
    fn default() -> Self {
        Self::new(vec![
            FaqEntry::new(
                &["cubre", "cobertura", "coberturas", "incluye", "ampara", "seguro"],
                "El seguro de autos cubre daños al vehículo por accidente, pérdida total o parcial por hurto, responsabilidad civil frente a terceros y asistencia en carretera. El alcance exacto depende del plan: Basico, Autos Clasico o Autos Global.",
                "Condiciones generales seguro de autos",
            ),
            FaqEntry::new(
                &["deducible", "franquicia", "siniestro", "pagar"],
                "El deducible es la parte de cada reclamación que asume el asegurado. En el Plan Basico es del 10% de la pérdida, en el Autos Clasico del 5% y en el Autos Global no aplica deducible para pérdidas parciales.",
                "Tabla de deducibles por plan",
            ),
            FaqEntry::new(
                &["diferencia", "planes", "plan", "global", "clasico", "basico"],
                "El Plan Basico protege contra responsabilidad civil y pérdida total. El Plan Autos Clasico agrega daños parciales y hurto parcial. El Plan Autos Global suma vehículo de reemplazo, gastos de transporte y cobertura en el exterior.",
                "Comparativo de planes",
            ),
            FaqEntry::new(
                &["requisitos", "documentos", "necesito", "expedir", "datos"],
                "Para expedir la póliza necesitas una cotización vigente, tu número de identificación, un celular de contacto y un correo electrónico. La póliza se emite de inmediato tras confirmar la compra.",
                "Proceso de expedición",
            ),
            FaqEntry::new(
                &["reclamar", "reclamacion", "accidente", "choque", "siniestro"],
                "Si tienes un accidente, comunícate con la línea de asistencia 24 horas, no muevas el vehículo si hay lesionados y toma fotos del lugar. La reclamación se radica con la denuncia o el informe de tránsito.",
                "Guía de reclamaciones",
            ),
            FaqEntry::new(
                &["pago", "cuotas", "mensual", "financiar", "tarjeta"],
                "Puedes pagar la prima anual de contado o en cuotas mensuales con tarjeta de crédito o débito automático. El valor mensual aparece en cada cotización.",
                "Medios de pago",
            ),
            FaqEntry::new(
                &["vigencia", "cancelar", "renovar", "renovacion", "dura"],
                "La póliza tiene vigencia de un año y se renueva automáticamente. Puedes cancelarla en cualquier momento; la prima no causada se devuelve proporcionalmente.",
                "Condiciones de vigencia y cancelación",
            ),
        ])
    }
}

fn confidence_for(matched: usize) -> f64 {
    match matched {
        0 => 0.0,
        1 => 0.5,
        2 => 0.75,
        _ => 0.9,
    }
}

#[async_trait]
impl RetrievalBackend for FaqRetrieval {
    fn name(&self) -> &'static str {
        "faq"
    }

    async fn query(
        &self,
        question: &str,
        _history: &[String],
    ) -> Result<RetrievalAnswer, CollaboratorError> {
        let tokens = token_set(question);
        let best = self
            .entries
            .iter()
            .map(|entry| {
                let matched =
                    entry.keywords.iter().filter(|keyword| tokens.contains(*keyword)).count();
                (matched, entry)
            })
            .max_by_key(|(matched, _)| *matched);

        Ok(match best {
            Some((matched, entry)) if matched > 0 => RetrievalAnswer {
                answer: entry.answer.clone(),
                confidence: confidence_for(matched),
                sources: vec![entry.source.clone()],
            },
            _ => RetrievalAnswer { answer: String::new(), confidence: 0.0, sources: Vec::new() },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::FaqRetrieval;
    use crate::collaborators::RetrievalBackend;

    #[tokio::test]
    async fn specific_question_scores_above_answer_threshold() {
        let faq = FaqRetrieval::default();
        let answer = faq.query("¿Qué cubre el seguro y cuál es la cobertura?", &[]).await.expect("query");

        assert!(answer.confidence >= 0.7);
        assert!(answer.answer.contains("responsabilidad civil"));
        assert_eq!(answer.sources.len(), 1);
    }

    #[tokio::test]
    async fn single_keyword_lands_between_floor_and_threshold() {
        let faq = FaqRetrieval::default();
        let answer = faq.query("hablame del deducible", &[]).await.expect("query");
        assert!(answer.confidence >= 0.4 && answer.confidence < 0.7);
    }

    #[tokio::test]
    async fn unrelated_question_has_zero_confidence() {
        let faq = FaqRetrieval::default();
        let answer = faq.query("¿a qué hora abre el museo?", &[]).await.expect("query");
        assert_eq!(answer.confidence, 0.0);
        assert!(answer.sources.is_empty());
    }
}
