fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", llmos_operator::crd::generate_crds()?);
    Ok(())
}
