//! CSV output: one row per (query, vantage point) in `ecsresults.csv`, and
//! the active vantage points in `vps.csv`.
use std::fs::File;
use std::path::Path;

use crate::error::ECSResult;
use crate::scan::{InstResponse, QueryRequest, VantagePoint};

pub struct EcsResultWriter {
    writer: csv::Writer<File>,
}

impl EcsResultWriter {
    pub fn create(output_basedir: &str) -> ECSResult<EcsResultWriter> {
        let path = Path::new(output_basedir).join("ecsresults.csv");
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "domain",
            "nameserver_ip",
            "vp_name",
            "client_subnet",
            "source_pl",
            "scope_pl",
            "error",
            "nsid",
            "answers",
            "cnames",
            "scan_timestamp",
        ])?;
        writer.flush()?;
        Ok(EcsResultWriter { writer })
    }

    /// Append one row. Rows are written for errored probes too, with the
    /// error flag set, so failed probes stay visible downstream.
    pub fn add_result(
        &mut self,
        request: &QueryRequest,
        inst_response: &InstResponse,
    ) -> ECSResult<()> {
        let mut answers = inst_response.answers.clone();
        answers.sort();
        let mut cnames = inst_response.cnames.clone();
        cnames.sort();

        let record = [
            request.domain.clone(),
            request.nameserver_ip.to_string(),
            inst_response.vp_name.clone(),
            request.ip_address_client.to_string(),
            request.source_prefix_length.to_string(),
            inst_response.scope_prefix_length.to_string(),
            inst_response.error.is_some().to_string(),
            inst_response.nsid.clone(),
            answers.join(";"),
            cnames.join(";"),
            inst_response.scan_timestamp.to_string(),
        ];
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        Ok(())
    }
}

pub struct VantagePointWriter {
    writer: csv::Writer<File>,
}

impl VantagePointWriter {
    pub fn create(output_basedir: &str) -> ECSResult<VantagePointWriter> {
        let path = Path::new(output_basedir).join("vps.csv");
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["shortname", "cc", "state", "city", "lat", "lon", "ipv4", "asn4"])?;
        Ok(VantagePointWriter { writer })
    }

    pub fn add_vps(&mut self, vps: &[VantagePoint]) -> ECSResult<()> {
        for vp in vps {
            let record = [
                vp.shortname.clone(),
                vp.cc.clone(),
                vp.state.clone(),
                vp.city.clone(),
                vp.lat.to_string(),
                vp.lon.to_string(),
                vp.ipv4.clone(),
                vp.asn4.to_string(),
            ];
            self.writer.write_record(&record)?;
        }
        Ok(())
    }

    pub fn close(mut self) -> ECSResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::IpAddr;

    fn temp_dir(tag: &str) -> String {
        let dir = std::env::temp_dir().join(format!("ecsprobe-{}-{}", tag, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.to_str().unwrap().to_string()
    }

    #[test]
    fn result_rows_are_sorted_and_flagged() {
        let dir = temp_dir("writer");
        let mut writer = EcsResultWriter::create(&dir).unwrap();

        let request = QueryRequest {
            identifier: 0,
            domain: "example.com".to_string(),
            nameserver_ip: "1.2.3.4".parse::<IpAddr>().unwrap(),
            ip_address_client: "10.0.1.0".parse::<IpAddr>().unwrap(),
            source_prefix_length: 24,
            family: 1,
        };
        let inst = InstResponse::new(
            0,
            "vp1",
            vec!["9.9.9.9".to_string(), "1.1.1.1".to_string()],
            vec![],
            16,
            "0xabcd".to_string(),
            None,
        );
        writer.add_result(&request, &inst).unwrap();

        let text = fs::read_to_string(Path::new(&dir).join("ecsresults.csv")).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("domain,"));
        let row = lines.next().unwrap();
        assert!(row.contains("1.1.1.1;9.9.9.9"));
        assert!(row.contains("10.0.1.0"));
        assert!(row.contains(",false,"));
        assert!(row.contains(",16,"));
    }
}
