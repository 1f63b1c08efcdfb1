use disbursement_curves::*;
use env_logger::Env;
use std::io::Cursor;

const PROJECTS_CSV: &str = "NoProyecto;IDAreaPrioritaria;IDAreaIntervencion;Pais;Alias
P10;INF;TRA;Argentina;Autopista Riberena
P20;SOC;SAL;Bolivia;Hospitales Andinos
P30;INF;ENE;Uruguay;Interconexion Norte
";

const STAGES_CSV: &str = "IDEtapa;NoProyecto;FechaVigencia;AporteFonplata;SECTOR;SUBSECTOR;APODO
AR-0010;P10;15-ago-14;45.000.000,00;Transporte;Vial;Tramo I
AR-0011;P10;1-dic-17;30.000.000,00;Transporte;Vial;Tramo II
BO-0020;P20;martes, 17 de noviembre de 2015;12.500.000,00;Social;Salud;
UR-0030;P30;2019-06-30;20.000.000,00;Energia;Transmision;
";

const DISBURSEMENTS_CSV: &str = "IDDesembolso;IDEtapa;FechaEfectiva;Monto
1;AR-0010;20/10/2014;9.000.000,00
2;AR-0010;03/02/2016;18.000.000,00
3;AR-0010;11/07/2017;18.000.000,00
4;AR-0011;02/03/2018;6.000.000,00
5;AR-0011;19/09/2019;9.000.000,00
6;BO-0020;10/01/2016;2.500.000,00
7;BO-0020;22/05/2017;5.000.000,00
8;BO-0020;14/04/2019;3.125.000,00
9;UR-0030;01/06/2019;500.000,00
10;UR-0030;12/02/2020;4.000.000,00
";

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    println!("📊 Disbursement Portfolio Report\n");

    let projects = SharedSource::new(Cursor::new(PROJECTS_CSV.as_bytes().to_vec()));
    let stages = SharedSource::new(Cursor::new(STAGES_CSV.as_bytes().to_vec()));
    let disbursements = SharedSource::new(Cursor::new(DISBURSEMENTS_CSV.as_bytes().to_vec()));

    let tables = decode_csv_tables(
        &[
            (PROJECTS, &projects),
            (STAGES, &stages),
            (DISBURSEMENTS, &disbursements),
        ],
        b';',
    )?;

    let report = build_report(&tables, &ReportConfig::default())?;

    let amounts = report.presentation_amounts()?;
    println!("💰 Disbursed amounts (millions) by elapsed year:\n");
    print_matrix(&report, &amounts);

    let percents = report.presentation_percentages()?;
    println!("\n📈 Percentage of ceiling by elapsed year:\n");
    print_matrix(&report, &percents);

    println!("\n🏁 Completion:\n");
    for c in &report.classifications {
        let last = c
            .last_active_period
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<40} {:>8}%  last year {:>3}  {}",
            report.label(&c.unit),
            c.total.round_dp(2),
            last,
            c.category
        );
    }
    for (category, count) in &report.category_counts {
        println!("  {}: {}", category, count);
    }

    let country_config = ReportConfig {
        grouping: GroupingKey::Country,
        ..ReportConfig::default()
    };
    let by_country = build_report(&tables, &country_config)?;
    println!("\n🌎 Argentina average curve:\n");
    for point in average_curve(&by_country.series, |unit| unit == "Argentina") {
        println!(
            "  year {:>2}: mean {:>14}  cumulative {:>6}%",
            point.period,
            point.mean_amount.round_dp(2),
            point
                .mean_cumulative_percent
                .map(|p| p.round_dp(2).to_string())
                .unwrap_or_else(|| "n/a".to_string())
        );
    }

    let dataset = Dataset::from_tables(&tables)?;
    let month = calendar_month_summary(&dataset.disbursements, 2019, 9)?;
    println!(
        "\n🗓  {} to {}: {} disbursements across {} stages, total {}",
        month.from, month.to, month.disbursements, month.distinct_stages, month.total_amount
    );

    let as_of = chrono::NaiveDate::from_ymd_opt(2021, 1, 1)
        .ok_or_else(|| anyhow::anyhow!("invalid analysis date"))?;
    let rfm = rfm_analysis(
        &dataset.stages,
        &dataset.disbursements,
        as_of,
        report.config.completion_tolerance,
    )?;
    println!("\n🎯 RFM segments as of {}:\n", as_of);
    for record in &rfm.records {
        println!(
            "  {:<10} R{} F{} M{}  {:<18} {}",
            record.stage_id,
            record.scores.recency,
            record.scores.frequency,
            record.scores.monetary,
            record.segment.to_string(),
            record.status
        );
    }
    for (segment, stats) in rfm.segment_stats() {
        if stats.count > 0 {
            println!("  {}: {} stages", segment, stats.count);
        }
    }

    if !report.diagnostics.undefined_units.is_empty() {
        println!(
            "\n⚠️  Units without a usable ceiling: {:?}",
            report.diagnostics.undefined_units
        );
    }

    Ok(())
}

fn print_matrix(report: &Report, matrix: &Matrix) {
    print!("  {:<40}", "Unit");
    for period in &matrix.periods {
        print!(" {:>9}", period);
    }
    println!(" {:>10}", "Total");

    for row in &matrix.rows {
        print!("  {:<40}", report.label(&row.unit));
        for cell in &row.cells {
            match cell.state {
                CellState::Undefined => print!(" {:>9}", "n/a"),
                _ => print!(" {:>9}", cell.value),
            }
        }
        println!(" {:>10}", row.total);
    }
}
