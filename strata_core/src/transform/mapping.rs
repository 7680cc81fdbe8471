//! Column mapping from source headers to curated fields.
//!
//! Headers are normalized first (accents stripped, lowercased, separators
//! folded to `_`), then matched against per-field alias tables. Spreadsheet
//! kinds get a second, looser pass for human-written headers.

use crate::ingest::models::SourceKind;
use std::collections::{HashMap, HashSet};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Normalize a header: NFKD, drop combining marks, trim, lowercase, map
/// ` / . - \` to `_`, collapse runs of `_`.
pub fn normalize_header(raw: &str) -> String {
    let folded: String = raw
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '.' | '-' | '\\' => '_',
            other => other,
        })
        .collect();

    let mut out = String::with_capacity(folded.len());
    for c in folded.chars() {
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('_').to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CuratedField {
    Period,
    Amount,
    Region,
    Status,
    MaturityBand,
    CreditorCode,
    RecordKey,
    Debtor,
    Document,
    DueDate,
    RecoveredAmount,
    Balance,
    FeeAmount,
    ContractFee,
    DaysOverdue,
}

impl CuratedField {
    pub const ALL: [CuratedField; 15] = [
        CuratedField::Period,
        CuratedField::Amount,
        CuratedField::Region,
        CuratedField::Status,
        CuratedField::MaturityBand,
        CuratedField::CreditorCode,
        CuratedField::RecordKey,
        CuratedField::Debtor,
        CuratedField::Document,
        CuratedField::DueDate,
        CuratedField::RecoveredAmount,
        CuratedField::Balance,
        CuratedField::FeeAmount,
        CuratedField::ContractFee,
        CuratedField::DaysOverdue,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CuratedField::Period => "period",
            CuratedField::Amount => "amount",
            CuratedField::Region => "region",
            CuratedField::Status => "status",
            CuratedField::MaturityBand => "maturity_band",
            CuratedField::CreditorCode => "creditor_code",
            CuratedField::RecordKey => "record_key",
            CuratedField::Debtor => "debtor",
            CuratedField::Document => "document",
            CuratedField::DueDate => "due_date",
            CuratedField::RecoveredAmount => "recovered_amount",
            CuratedField::Balance => "balance",
            CuratedField::FeeAmount => "fee_amount",
            CuratedField::ContractFee => "contract_fee",
            CuratedField::DaysOverdue => "days_overdue",
        }
    }

    /// A row without these cannot become a fact.
    pub fn is_required(&self) -> bool {
        matches!(self, CuratedField::Period | CuratedField::Amount)
    }

    /// Normalized header names accepted on the exact pass.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            CuratedField::Period => &[
                "period",
                "dt_cadastro",
                "data_cadastro",
                "created_at",
                "dt_criacao",
            ],
            CuratedField::Amount => &["amount", "vl_titulo", "valor", "valor_titulo"],
            CuratedField::Region => &["region", "uf", "estado", "state"],
            CuratedField::Status => &[
                "status",
                "situacao_processo",
                "situacao",
                "situacao_do_processo",
            ],
            CuratedField::MaturityBand => &[
                "maturity_band",
                "faixa_vencimento",
                "faixa_de_vencimento",
                "faixa",
                "vencimento_faixa",
            ],
            CuratedField::CreditorCode => &[
                "creditor_code",
                "credor_code",
                "cod_cliente",
                "codigo_cliente",
                "id_cliente",
                "cliente_codigo",
                "codigo_credor",
                "cod_credor",
                "cliente_cod",
            ],
            CuratedField::RecordKey => &[
                "record_key",
                "processo",
                "n_processo",
                "num_processo",
                "numero_processo",
                "numero_do_processo",
                "nro_processo",
            ],
            CuratedField::Debtor => &["debtor", "devedor", "nome_devedor", "devedora", "nome", "sacado"],
            CuratedField::Document => &["document", "cpf_cnpj", "cpf", "cnpj", "documento", "cpf_cgc"],
            CuratedField::DueDate => &["due_date", "dt_vencimento", "vencimento", "data_vencimento"],
            CuratedField::RecoveredAmount => &[
                "recovered_amount",
                "vl_total_repasse",
                "valor_repasse",
                "repasse",
            ],
            CuratedField::Balance => &["balance", "vl_saldo", "saldo", "valor_saldo", "vl_sld"],
            CuratedField::FeeAmount => &[
                "fee_amount",
                "vl_honorario_devedor",
                "honorario_devedor",
                "vl_honorario",
                "valor_honorario_devedor",
            ],
            CuratedField::ContractFee => &["contract_fee", "vl_tx_contrato", "tx_contrato", "taxa_contrato", "vl_tx"],
            CuratedField::DaysOverdue => &[
                "days_overdue",
                "dias_vencidos_cadastro",
                "dias_vencidos_no_cadastro",
                "dias_vencidos",
            ],
        }
    }

    /// Loose match for spreadsheet headers the alias table misses.
    fn fuzzy_matches(&self, normalized: &str) -> bool {
        let has = |s: &str| normalized.contains(s);
        match self {
            CuratedField::Document => has("cpf") || has("cnpj"),
            CuratedField::Debtor => has("devedor") || has("sacado"),
            CuratedField::RecordKey => has("processo") && !has("situacao"),
            CuratedField::CreditorCode => {
                (has("cod") && has("cliente")) || normalized == "credor" || has("cod_credor")
            }
            CuratedField::MaturityBand => has("faixa") && has("venc"),
            CuratedField::Period => has("cadastro") && (has("dt") || has("data")),
            CuratedField::Amount => has("valor") && has("titulo"),
            _ => false,
        }
    }
}

/// Which source header feeds each curated field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    columns: HashMap<CuratedField, String>,
}

impl ColumnMapping {
    /// Resolve a header set. Exact aliases win; for spreadsheet kinds, unclaimed
    /// headers are then offered to the loose rules. First matching header wins.
    pub fn resolve<'a, I>(kind: SourceKind, headers: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let normalized: Vec<(&str, String)> = headers
            .into_iter()
            .map(|h| (h, normalize_header(h)))
            .collect();

        let mut columns = HashMap::new();
        let mut claimed: HashSet<&str> = HashSet::new();

        for field in CuratedField::ALL {
            let aliases = field.aliases();
            if let Some((raw, _)) = normalized
                .iter()
                .find(|(raw, n)| aliases.contains(&n.as_str()) && !claimed.contains(raw))
            {
                claimed.insert(*raw);
                columns.insert(field, raw.to_string());
            }
        }

        if kind.is_spreadsheet() {
            for field in CuratedField::ALL {
                if columns.contains_key(&field) {
                    continue;
                }
                if let Some((raw, _)) = normalized
                    .iter()
                    .find(|(raw, n)| !claimed.contains(raw) && field.fuzzy_matches(n))
                {
                    claimed.insert(*raw);
                    columns.insert(field, raw.to_string());
                }
            }
        }

        Self { columns }
    }

    pub fn column(&self, field: CuratedField) -> Option<&str> {
        self.columns.get(&field).map(String::as_str)
    }

    pub fn missing_required(&self) -> Vec<CuratedField> {
        CuratedField::ALL
            .into_iter()
            .filter(|f| f.is_required() && !self.columns.contains_key(f))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_accents_and_separators() {
        assert_eq!(normalize_header(" Situação do Processo "), "situacao_do_processo");
        assert_eq!(normalize_header("Vl. Título"), "vl_titulo");
        assert_eq!(normalize_header("CPF/CNPJ"), "cpf_cnpj");
        assert_eq!(normalize_header("Dt-Cadastro\\"), "dt_cadastro");
    }

    #[test]
    fn sql_uses_exact_aliases_only() {
        let headers = ["dt_cadastro", "vl_titulo", "uf", "Doc CPF Cliente"];
        let m = ColumnMapping::resolve(SourceKind::Sql, headers);
        assert_eq!(m.column(CuratedField::Period), Some("dt_cadastro"));
        assert_eq!(m.column(CuratedField::Amount), Some("vl_titulo"));
        assert_eq!(m.column(CuratedField::Region), Some("uf"));
        assert_eq!(m.column(CuratedField::Document), None);
        assert!(m.missing_required().is_empty());
    }

    #[test]
    fn spreadsheets_get_loose_rules() {
        let headers = [
            "Data Cadastro",
            "Valor",
            "Faixa Venc.",
            "Doc CPF Cliente",
            "Situação Processo",
            "Cód. Cliente",
        ];
        let m = ColumnMapping::resolve(SourceKind::CsvUpload, headers);
        assert_eq!(m.column(CuratedField::Period), Some("Data Cadastro"));
        assert_eq!(m.column(CuratedField::MaturityBand), Some("Faixa Venc."));
        assert_eq!(m.column(CuratedField::Document), Some("Doc CPF Cliente"));
        assert_eq!(m.column(CuratedField::Status), Some("Situação Processo"));
        assert_eq!(m.column(CuratedField::CreditorCode), Some("Cód. Cliente"));
        // The status column must not be reused as the record key.
        assert_eq!(m.column(CuratedField::RecordKey), None);
    }

    #[test]
    fn reports_missing_required_fields() {
        let m = ColumnMapping::resolve(SourceKind::GoogleSheets, ["uf", "processo"]);
        assert_eq!(
            m.missing_required(),
            vec![CuratedField::Period, CuratedField::Amount]
        );
    }
}
