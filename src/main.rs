use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use bdmmflow::configuration::LikelihoodConfiguration;
use bdmmflow::likelihood::birthdeathmigrationdistribution::BirthDeathMigrationDistribution;
use bdmmflow::likelihood::directintegration::DirectIntegrationLikelihood;
use bdmmflow::likelihooderror::LikelihoodResult;
use bdmmflow::parameterization::canonicalparameterization::CanonicalParameterization;
use bdmmflow::parameterization::parameterization::Parameterization;
use bdmmflow::parameterization::skylineparameter::{
    SkylineMatrix,
    SkylineVector
};
use bdmmflow::tree::newickparser::parse_newick;

const NEWICK: &str = "(t1[&state=0]:1.5, t2[&state=1]:0.5);";

fn main() -> LikelihoodResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let parameterization: Arc<dyn Parameterization> = Arc::new(
        CanonicalParameterization::builder(2.5, 2)
            .birth_rate(SkylineVector::constant(vec![2.0, 2.0]))
            .death_rate(SkylineVector::constant(vec![1.0, 1.0]))
            .sampling_rate(SkylineVector::constant(vec![0.5, 0.5]))
            .removal_prob(SkylineVector::constant(vec![1.0, 1.0]))
            .migration_rate(SkylineMatrix::broadcast(vec![1.0], vec![0.1, 0.2], 2)?)
            .build()?,
    );
    let tree = Arc::new(parse_newick(NEWICK)?);
    let config = match std::env::args().nth(1) {
        Some(path) => LikelihoodConfiguration::from_reader(path)?,
        None => LikelihoodConfiguration::default()
            .with_type_label("state")
            .with_frequencies(vec![0.5, 0.5]),
    };

    let distribution = BirthDeathMigrationDistribution::new(
        Arc::clone(&parameterization),
        Arc::clone(&tree),
        config.clone(),
    )?;
    let flow = distribution.log_likelihood()?;
    let direct = DirectIntegrationLikelihood::new(parameterization, tree, config)?.log_likelihood()?;

    info!(newick = NEWICK, "tree loaded");
    println!("flow log-likelihood:   {flow:.7}");
    println!("direct log-likelihood: {direct:.7}");
    Ok(())
}
