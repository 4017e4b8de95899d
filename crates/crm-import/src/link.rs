//! Turns the importer's name-keyed output into the ID-keyed tables the CRM
//! application reads.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use crm_core::{Client, Contract, ImportedContract};
use crm_storage::CsvStore;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub clients: usize,
    pub contracts: usize,
    /// Client names of contracts that matched no imported client.
    pub unresolved: Vec<String>,
    /// Names shared by more than one client; contracts go to the first one.
    pub duplicate_names: Vec<String>,
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Assign progressive IDs (1..n, sheet order) and resolve each contract's
/// client name to the first client carrying it.
pub fn link_import(
    mut clients: Vec<Client>,
    contracts: Vec<ImportedContract>,
) -> (Vec<Client>, Vec<Contract>, LinkReport) {
    let mut ids_by_name: HashMap<String, String> = HashMap::new();
    let mut duplicates = BTreeSet::new();

    for (index, client) in clients.iter_mut().enumerate() {
        client.client_id = (index + 1).to_string();
        let key = name_key(&client.company_name);
        if ids_by_name.contains_key(&key) {
            duplicates.insert(client.company_name.trim().to_string());
        } else {
            ids_by_name.insert(key, client.client_id.clone());
        }
    }

    let mut unresolved = BTreeSet::new();
    let linked: Vec<Contract> = contracts
        .into_iter()
        .map(|contract| {
            let id = match ids_by_name.get(&name_key(&contract.client_name)) {
                Some(id) => id.clone(),
                None => {
                    unresolved.insert(contract.client_name.clone());
                    String::new()
                }
            };
            contract.into_contract(id)
        })
        .collect();

    let report = LinkReport {
        clients: clients.len(),
        contracts: linked.len(),
        unresolved: unresolved.into_iter().collect(),
        duplicate_names: duplicates.into_iter().collect(),
    };
    (clients, linked, report)
}

/// Read the import tables from `store`, link them and write the CRM tables.
pub fn run_link(store: &CsvStore) -> Result<LinkReport> {
    let (clients, contracts) = store
        .load_imported()
        .with_context(|| format!("loading import tables from {}", store.root().display()))?;
    let (clients, contracts, report) = link_import(clients, contracts);

    for name in &report.duplicate_names {
        warn!(client = %name, "duplicate client name; contracts linked to the first occurrence");
    }
    for name in &report.unresolved {
        warn!(client = %name, "contracts reference an unknown client");
    }

    store.save_clients(&clients).context("writing linked clients")?;
    store.save_contracts(&contracts).context("writing linked contracts")?;
    info!(clients = report.clients, contracts = report.contracts, "linked import tables");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract_for(name: &str, number: &str) -> ImportedContract {
        ImportedContract {
            client_name: name.into(),
            contract_number: number.into(),
            ..ImportedContract::default()
        }
    }

    #[test]
    fn ids_follow_client_order_and_names_resolve() {
        let clients = vec![Client::named("Alfa SRL"), Client::named("Beta SPA")];
        let contracts = vec![contract_for("beta spa ", "B-1"), contract_for("Alfa SRL", "A-1")];

        let (clients, contracts, report) = link_import(clients, contracts);

        assert_eq!(clients[0].client_id, "1");
        assert_eq!(clients[1].client_id, "2");
        assert_eq!(contracts[0].client_id, "2");
        assert_eq!(contracts[1].client_id, "1");
        assert!(report.unresolved.is_empty());
        assert!(report.duplicate_names.is_empty());
    }

    #[test]
    fn duplicates_and_orphans_are_reported_not_merged() {
        let clients = vec![Client::named("Gamma"), Client::named("GAMMA")];
        let contracts = vec![contract_for("Gamma", "G-1"), contract_for("Delta", "D-1")];

        let (clients, contracts, report) = link_import(clients, contracts);

        assert_eq!(clients.len(), 2);
        assert_eq!(contracts[0].client_id, "1");
        assert_eq!(contracts[1].client_id, "");
        assert_eq!(report.duplicate_names, vec!["GAMMA".to_string()]);
        assert_eq!(report.unresolved, vec!["Delta".to_string()]);
    }
}
